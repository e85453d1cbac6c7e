//! Infrastructure wiring: event store/bus, projections, dispatcher and
//! external adapters, assembled once at startup.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::PgPool;

use billflow_auth::{
    CreateAccount, Hs256Tokens, LoginThrottle, StaffAccount, StaffAccountCommand, StaffRole,
    hash_password,
};
use billflow_billing::{Invoice, InvoiceCommand, InvoiceId};
use billflow_core::{AggregateId, DomainError, UserId};
use billflow_events::{EventBus, EventEnvelope, InMemoryEventBus};
use billflow_infra::{
    CommandDispatcher, DispatchError, InMemoryActivityLog, InMemoryEventStore, InMemoryKeyedStore,
    event_store::{EventStore, PostgresEventStore, StoredEvent},
    gateway::{RecordingCheckoutGateway, StripeCheckoutClient, UnconfiguredGateway},
    mailer::{Mailer, RecordingMailer, SmtpMailer},
    projections::{
        InvoiceReadModel, InvoicesProjection, StaffDirectoryProjection, StaffReadModel, invoices,
        staff,
    },
    stock_api::{HttpStockGateway, InMemoryStockGateway},
};
use billflow_payments::{CheckoutGateway, WebhookSignatureVerifier};
use billflow_stock::StockGateway;

use crate::config::AppConfig;

type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
type InvoicesRm = Arc<InvoicesProjection<Arc<InMemoryKeyedStore<InvoiceId, InvoiceReadModel>>>>;
type StaffRm = Arc<StaffDirectoryProjection<Arc<InMemoryKeyedStore<UserId, StaffReadModel>>>>;

/// The event-store-dependent half of the wiring. In-memory by default,
/// Postgres when `DATABASE_URL` is configured.
enum Dispatcher {
    InMemory {
        dispatcher: CommandDispatcher<Arc<InMemoryEventStore>, Bus>,
        store: Arc<InMemoryEventStore>,
    },
    Postgres {
        dispatcher: CommandDispatcher<Arc<PostgresEventStore>, Bus>,
        store: Arc<PostgresEventStore>,
    },
}

impl Dispatcher {
    async fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: billflow_core::Aggregate<Error = DomainError>,
        A::Event: billflow_events::Event + serde::Serialize + serde::de::DeserializeOwned,
    {
        match self {
            Dispatcher::InMemory { dispatcher, .. } => {
                dispatcher
                    .dispatch::<A>(aggregate_id, aggregate_type, command, make_aggregate)
                    .await
            }
            Dispatcher::Postgres { dispatcher, .. } => {
                dispatcher
                    .dispatch::<A>(aggregate_id, aggregate_type, command, make_aggregate)
                    .await
            }
        }
    }

    async fn load_stream(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        let stream = match self {
            Dispatcher::InMemory { store, .. } => store.load_stream(aggregate_id).await?,
            Dispatcher::Postgres { store, .. } => store.load_stream(aggregate_id).await?,
        };
        Ok(stream)
    }

    async fn load_all(&self) -> Result<Vec<StoredEvent>, DispatchError> {
        let events = match self {
            Dispatcher::InMemory { store, .. } => store.load_all().await?,
            Dispatcher::Postgres { store, .. } => store.load_all().await?,
        };
        Ok(events)
    }
}

/// External collaborators, injected so tests can substitute recording
/// fakes.
pub struct ExternalAdapters {
    pub checkout_gateway: Arc<dyn CheckoutGateway>,
    pub stock_gateway: Arc<dyn StockGateway>,
    pub mailer: Arc<dyn Mailer>,
}

impl ExternalAdapters {
    /// Derive adapters from configuration. Absent credentials yield
    /// fail-at-call-time stand-ins (checkout) or recording fakes
    /// (stock/mail) so a dev instance boots without any secrets.
    pub fn from_config(config: &AppConfig) -> Self {
        let checkout_gateway: Arc<dyn CheckoutGateway> = match &config.stripe_secret_key {
            Some(key) => match StripeCheckoutClient::new(key.clone()) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    tracing::warn!("checkout gateway unavailable: {e}");
                    Arc::new(UnconfiguredGateway)
                }
            },
            None => Arc::new(UnconfiguredGateway),
        };

        let stock_gateway: Arc<dyn StockGateway> =
            match (&config.stock_api_base, &config.stock_api_key) {
                (Some(base), Some(key)) => match HttpStockGateway::new(base.clone(), key.clone()) {
                    Ok(client) => Arc::new(client),
                    Err(e) => {
                        tracing::warn!("stock gateway unavailable: {e}");
                        Arc::new(InMemoryStockGateway::new())
                    }
                },
                _ => Arc::new(InMemoryStockGateway::new()),
            };

        let mailer: Arc<dyn Mailer> = match &config.smtp {
            Some(smtp) => {
                match SmtpMailer::new(&smtp.server, &smtp.username, &smtp.password, &smtp.from) {
                    Ok(mailer) => Arc::new(mailer),
                    Err(e) => {
                        tracing::warn!("smtp mailer unavailable: {e}");
                        Arc::new(RecordingMailer::new())
                    }
                }
            }
            None => Arc::new(RecordingMailer::new()),
        };

        Self {
            checkout_gateway,
            stock_gateway,
            mailer,
        }
    }

    /// All-recording adapters (tests).
    pub fn recording() -> (
        Self,
        Arc<RecordingCheckoutGateway>,
        Arc<InMemoryStockGateway>,
        Arc<RecordingMailer>,
    ) {
        let checkout = Arc::new(RecordingCheckoutGateway::new());
        let stock = Arc::new(InMemoryStockGateway::new());
        let mailer = Arc::new(RecordingMailer::new());
        (
            Self {
                checkout_gateway: checkout.clone(),
                stock_gateway: stock.clone(),
                mailer: mailer.clone(),
            },
            checkout,
            stock,
            mailer,
        )
    }
}

pub struct AppServices {
    dispatcher: Dispatcher,
    invoices: InvoicesRm,
    staff: StaffRm,
    pub checkout_gateway: Arc<dyn CheckoutGateway>,
    pub stock_gateway: Arc<dyn StockGateway>,
    pub mailer: Arc<dyn Mailer>,
    pub activity_log: Arc<InMemoryActivityLog>,
    pub tokens: Arc<Hs256Tokens>,
    pub login_throttle: Arc<LoginThrottle>,
    verifier: Option<WebhookSignatureVerifier>,
    pub config: AppConfig,
}

pub async fn build_services(config: AppConfig, adapters: ExternalAdapters) -> AppServices {
    let bus: Bus = Arc::new(InMemoryEventBus::new());

    let invoices: InvoicesRm = Arc::new(InvoicesProjection::new(Arc::new(
        InMemoryKeyedStore::new(),
    )));
    let staff: StaffRm = Arc::new(StaffDirectoryProjection::new(Arc::new(
        InMemoryKeyedStore::new(),
    )));

    // Background subscriber: bus -> projections.
    {
        let sub = bus.subscribe();
        let invoices = invoices.clone();
        let staff = staff.clone();
        tokio::task::spawn_blocking(move || {
            loop {
                match sub.recv() {
                    Ok(env) => {
                        let result = match env.aggregate_type() {
                            invoices::AGGREGATE_TYPE => {
                                invoices.apply_envelope(&env).map_err(|e| e.to_string())
                            }
                            staff::AGGREGATE_TYPE => {
                                staff.apply_envelope(&env).map_err(|e| e.to_string())
                            }
                            _ => Ok(()),
                        };
                        if let Err(e) = result {
                            tracing::warn!("projection apply failed: {e}");
                        }
                    }
                    Err(_) => break,
                }
            }
        });
    }

    let dispatcher = match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .expect("failed to connect to Postgres");
            let store = Arc::new(PostgresEventStore::new(pool));
            Dispatcher::Postgres {
                dispatcher: CommandDispatcher::new(store.clone(), bus.clone()),
                store,
            }
        }
        None => {
            let store = Arc::new(InMemoryEventStore::new());
            Dispatcher::InMemory {
                dispatcher: CommandDispatcher::new(store.clone(), bus.clone()),
                store,
            }
        }
    };

    // Read models are in-memory and rebuildable: replay the whole store
    // through the projections before serving traffic.
    match dispatcher.load_all().await {
        Ok(history) => {
            for stored in history {
                let env = stored.to_envelope();
                let result = match env.aggregate_type() {
                    invoices::AGGREGATE_TYPE => {
                        invoices.apply_envelope(&env).map_err(|e| e.to_string())
                    }
                    staff::AGGREGATE_TYPE => staff.apply_envelope(&env).map_err(|e| e.to_string()),
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    tracing::warn!("projection replay failed: {e}");
                }
            }
        }
        Err(e) => tracing::warn!("event store replay failed: {e:?}"),
    }

    let tokens = Arc::new(Hs256Tokens::new(
        config.jwt_secret.as_bytes(),
        config.token_ttl(),
    ));
    let login_throttle = Arc::new(LoginThrottle::new(
        config.login_max_failures,
        config.login_cooldown(),
    ));
    let verifier = config
        .webhook_secret
        .as_ref()
        .map(|secret| WebhookSignatureVerifier::new(secret.clone(), config.webhook_tolerance_secs));

    let services = AppServices {
        dispatcher,
        invoices,
        staff,
        checkout_gateway: adapters.checkout_gateway,
        stock_gateway: adapters.stock_gateway,
        mailer: adapters.mailer,
        activity_log: Arc::new(InMemoryActivityLog::new()),
        tokens,
        login_throttle,
        verifier,
        config,
    };

    seed_admin(&services).await;

    services
}

/// Bootstrap super admin from configuration, created once when its email
/// is not yet in the directory.
async fn seed_admin(services: &AppServices) {
    let Some((email, password)) = services.config.seed_admin.clone() else {
        return;
    };
    if services.staff().find_active_by_email(&email).is_some() {
        return;
    }
    let password_hash = match hash_password(&password) {
        Ok(hash) => hash,
        Err(e) => {
            tracing::warn!("seed admin skipped: {e}");
            return;
        }
    };

    let user_id = UserId::new();
    let result = services
        .dispatch_account(
            user_id,
            StaffAccountCommand::Create(CreateAccount {
                user_id,
                email: email.clone(),
                display_name: "Administrator".to_string(),
                role: StaffRole::SuperAdmin,
                password_hash,
                occurred_at: Utc::now(),
            }),
        )
        .await;

    match result {
        Ok(_) => tracing::info!(%email, "seed super admin created"),
        Err(e) => tracing::warn!("seed admin failed: {e:?}"),
    }
}

impl AppServices {
    pub fn invoices(&self) -> &InvoicesRm {
        &self.invoices
    }

    pub fn staff(&self) -> &StaffRm {
        &self.staff
    }

    pub fn verifier(&self) -> Option<&WebhookSignatureVerifier> {
        self.verifier.as_ref()
    }

    pub async fn dispatch_invoice(
        &self,
        aggregate_id: AggregateId,
        command: InvoiceCommand,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatcher
            .dispatch::<Invoice>(aggregate_id, invoices::AGGREGATE_TYPE, command, |id| {
                Invoice::empty(InvoiceId::new(id))
            })
            .await
    }

    pub async fn dispatch_account(
        &self,
        user_id: UserId,
        command: StaffAccountCommand,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatcher
            .dispatch::<StaffAccount>(user_id.into(), staff::AGGREGATE_TYPE, command, |id| {
                StaffAccount::empty(id.into())
            })
            .await
    }

    /// Load the authoritative invoice state straight from the stream
    /// (the read model may lag behind the bus).
    pub async fn load_invoice(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Option<Invoice>, DispatchError> {
        let stream = self.dispatcher.load_stream(aggregate_id).await?;
        if stream.is_empty() {
            return Ok(None);
        }

        use billflow_core::Aggregate;

        let mut invoice = Invoice::empty(InvoiceId::new(aggregate_id));
        for stored in &stream {
            let ev: billflow_billing::InvoiceEvent = serde_json::from_value(stored.payload.clone())
                .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
            invoice.apply(&ev);
        }
        Ok(Some(invoice))
    }
}
