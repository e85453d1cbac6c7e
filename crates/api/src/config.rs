//! Environment-driven process configuration.

use chrono::Duration;

/// SMTP relay settings for outbound invoice email.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// Process configuration, collected once at startup.
///
/// Absent gateway credentials do not fail boot; the affected operations
/// report a configuration error when called.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub jwt_secret: String,
    pub token_ttl_secs: i64,

    /// Base URL the public invoice view is served under (redirect targets).
    pub public_base_url: String,

    pub stripe_secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_tolerance_secs: i64,

    pub stock_api_base: Option<String>,
    pub stock_api_key: Option<String>,

    pub smtp: Option<SmtpConfig>,

    /// Grace period added to the due date before the sweep marks an
    /// invoice overdue. Zero means "due date fully elapsed".
    pub overdue_grace_secs: i64,
    /// Per-invoice cooldown between invoice emails.
    pub email_cooldown_secs: i64,

    pub login_max_failures: u32,
    pub login_cooldown_secs: i64,

    /// When set, the event store is Postgres-backed; in-memory otherwise.
    pub database_url: Option<String>,

    /// Bootstrap super admin, created at startup when the directory is
    /// empty (email, password).
    pub seed_admin: Option<(String, String)>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
            tracing::warn!("JWT_SECRET not set; using insecure dev default");
            "dev-secret".to_string()
        });

        let smtp = match (
            std::env::var("SMTP_SERVER"),
            std::env::var("SMTP_USERNAME"),
            std::env::var("SMTP_PASSWORD"),
            std::env::var("SMTP_FROM"),
        ) {
            (Ok(server), Ok(username), Ok(password), Ok(from)) => Some(SmtpConfig {
                server,
                username,
                password,
                from,
            }),
            _ => None,
        };

        let seed_admin = match (
            std::env::var("SEED_ADMIN_EMAIL"),
            std::env::var("SEED_ADMIN_PASSWORD"),
        ) {
            (Ok(email), Ok(password)) => Some((email, password)),
            _ => None,
        };

        Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            jwt_secret,
            token_ttl_secs: env_parsed("TOKEN_TTL_SECONDS", 8 * 60 * 60),
            public_base_url: env_or("PUBLIC_BASE_URL", "http://localhost:8080"),
            stripe_secret_key: std::env::var("STRIPE_SECRET_KEY").ok(),
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
            webhook_tolerance_secs: env_parsed("WEBHOOK_TOLERANCE_SECONDS", 300),
            stock_api_base: std::env::var("STOCK_API_BASE").ok(),
            stock_api_key: std::env::var("STOCK_API_KEY").ok(),
            smtp,
            overdue_grace_secs: env_parsed("OVERDUE_GRACE_SECONDS", 0),
            email_cooldown_secs: env_parsed("EMAIL_COOLDOWN_SECONDS", 300),
            login_max_failures: env_parsed("LOGIN_MAX_FAILURES", 5),
            login_cooldown_secs: env_parsed("LOGIN_COOLDOWN_SECONDS", 15 * 60),
            database_url: std::env::var("DATABASE_URL").ok(),
            seed_admin,
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::seconds(self.token_ttl_secs)
    }

    pub fn login_cooldown(&self) -> Duration {
        Duration::seconds(self.login_cooldown_secs)
    }

    /// Cutoff grace as a chrono duration.
    pub fn overdue_grace(&self) -> Duration {
        Duration::seconds(self.overdue_grace_secs)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
