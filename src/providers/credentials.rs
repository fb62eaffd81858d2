use crate::config::ProviderSchema;
use crate::Result;

/// A credential set handed to storage providers on demand.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Access key id, for key-pair backends.
    pub access_key: Option<String>,
    /// Secret access key.
    pub secret_key: Option<String>,
    /// Session or bearer token.
    pub session_token: Option<String>,
    /// When the set stops being valid; `None` means it never expires.
    pub expiration: Option<time::OffsetDateTime>,
}

impl Credentials {
    /// Whether the set still has a comfortable validity margin. Sets within
    /// 300 seconds of expiry are refreshed eagerly.
    pub fn is_fresh(&self) -> bool {
        match self.expiration {
            None => true,
            Some(expiration) => {
                time::OffsetDateTime::now_utc() + time::Duration::seconds(300) < expiration
            }
        }
    }
}

/// Trait that refreshes credentials when they expire.
///
/// Implementations supply storage and retrieval of the cached set plus the
/// actual fetch; `get` layers the refresh policy on top and is what storage
/// providers call on demand.
#[async_trait::async_trait]
pub trait CredentialsProvider: Send + Sync + std::fmt::Debug {
    /// Returns the credentials currently held by this provider, if any.
    async fn cached(&self) -> Option<Credentials>;

    /// Replaces the held credentials.
    async fn store(&self, credentials: Credentials) -> Result<()>;

    /// Fetches a new credential set from the source of truth.
    async fn fetch(&self) -> Result<Credentials>;

    /// Returns valid, unexpired credentials, fetching a replacement when the
    /// held set is missing or close to expiry.
    async fn get(&self) -> Result<Credentials> {
        match self.cached().await {
            Some(credentials) if credentials.is_fresh() => Ok(credentials),
            _ => {
                let credentials = self.fetch().await?;
                self.store(credentials.clone()).await?;
                Ok(credentials)
            }
        }
    }
}

/// A fixed credential set taken from profile options (`access_key`,
/// `secret_key`, `session_token`).
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credentials: Credentials,
}

impl StaticCredentials {
    /// Builds from a credential set.
    pub fn new(credentials: Credentials) -> Self {
        StaticCredentials { credentials }
    }

    pub(crate) fn from_options(schema: &ProviderSchema) -> Self {
        StaticCredentials {
            credentials: Credentials {
                access_key: schema.option_str("access_key").map(str::to_string),
                secret_key: schema.option_str("secret_key").map(str::to_string),
                session_token: schema.option_str("session_token").map(str::to_string),
                expiration: None,
            },
        }
    }
}

#[async_trait::async_trait]
impl CredentialsProvider for StaticCredentials {
    async fn cached(&self) -> Option<Credentials> {
        Some(self.credentials.clone())
    }

    async fn store(&self, _credentials: Credentials) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// Credentials read from the environment on each refresh. Option keys name
/// the variables (`access_key_var`, `secret_key_var`, `session_token_var`);
/// the AWS-style names are the defaults.
#[derive(Debug)]
pub struct EnvCredentials {
    access_key_var: String,
    secret_key_var: String,
    session_token_var: String,
    held: tokio::sync::RwLock<Option<Credentials>>,
}

impl Default for EnvCredentials {
    fn default() -> Self {
        EnvCredentials {
            access_key_var: "AWS_ACCESS_KEY_ID".to_string(),
            secret_key_var: "AWS_SECRET_ACCESS_KEY".to_string(),
            session_token_var: "AWS_SESSION_TOKEN".to_string(),
            held: tokio::sync::RwLock::new(None),
        }
    }
}

impl EnvCredentials {
    pub(crate) fn from_options(schema: &ProviderSchema) -> Self {
        let defaults = EnvCredentials::default();
        EnvCredentials {
            access_key_var: schema
                .option_str("access_key_var")
                .unwrap_or(&defaults.access_key_var)
                .to_string(),
            secret_key_var: schema
                .option_str("secret_key_var")
                .unwrap_or(&defaults.secret_key_var)
                .to_string(),
            session_token_var: schema
                .option_str("session_token_var")
                .unwrap_or(&defaults.session_token_var)
                .to_string(),
            held: tokio::sync::RwLock::new(None),
        }
    }
}

#[async_trait::async_trait]
impl CredentialsProvider for EnvCredentials {
    async fn cached(&self) -> Option<Credentials> {
        self.held.read().await.clone()
    }

    async fn store(&self, credentials: Credentials) -> Result<()> {
        *self.held.write().await = Some(credentials);
        Ok(())
    }

    async fn fetch(&self) -> Result<Credentials> {
        Ok(Credentials {
            access_key: std::env::var(&self.access_key_var).ok(),
            secret_key: std::env::var(&self.secret_key_var).ok(),
            session_token: std::env::var(&self.session_token_var).ok(),
            expiration: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct CountingProvider {
        held: tokio::sync::RwLock<Option<Credentials>>,
        fetches: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl CredentialsProvider for CountingProvider {
        async fn cached(&self) -> Option<Credentials> {
            self.held.read().await.clone()
        }

        async fn store(&self, credentials: Credentials) -> Result<()> {
            *self.held.write().await = Some(credentials);
            Ok(())
        }

        async fn fetch(&self) -> Result<Credentials> {
            self.fetches
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Credentials {
                access_key: Some("ak".to_string()),
                expiration: Some(time::OffsetDateTime::now_utc() + time::Duration::hours(1)),
                ..Credentials::default()
            })
        }
    }

    #[tokio::test]
    async fn get_fetches_once_while_fresh() -> Result<(), Box<dyn std::error::Error>> {
        let provider = CountingProvider::default();
        provider.get().await?;
        provider.get().await?;
        assert_eq!(provider.fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn near_expiry_triggers_refresh() -> Result<(), Box<dyn std::error::Error>> {
        let provider = CountingProvider::default();
        provider
            .store(Credentials {
                expiration: Some(time::OffsetDateTime::now_utc() + time::Duration::seconds(10)),
                ..Credentials::default()
            })
            .await?;
        provider.get().await?;
        assert_eq!(provider.fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
        Ok(())
    }
}
