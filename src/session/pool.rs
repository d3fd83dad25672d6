use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::browser::fingerprint::FingerprintManager;
use crate::browser::user_agent::UserAgentPool;
use crate::config::{IdentitySettings, ProxySettings, SessionPoolSettings};
use crate::proxy::rotator::ProxyRotator;
use crate::session::Session;

/// Identity state shared by all sessions, guarded by a single lock
struct PoolState {
    sessions: HashMap<String, Session>,
    user_agents: UserAgentPool,
    proxies: ProxyRotator,
    fingerprints: FingerprintManager,
}

/// Pool of health-scored sessions
pub struct SessionPool {
    config: SessionPoolSettings,
    state: Mutex<PoolState>,
}

impl SessionPool {
    pub fn new(
        config: SessionPoolSettings,
        identity: &IdentitySettings,
        proxy: &ProxySettings,
    ) -> Result<Self> {
        if config.max_pool_size == 0 {
            anyhow::bail!("Session pool size must be at least 1");
        }

        let state = PoolState {
            sessions: HashMap::new(),
            user_agents: UserAgentPool::new(identity.user_agents.clone())?,
            proxies: ProxyRotator::new(proxy),
            fingerprints: FingerprintManager::new(
                identity.browser_profiles.clone(),
                identity.fingerprint_cache_size,
            ),
        };

        Ok(Self {
            config,
            state: Mutex::new(state),
        })
    }

    /// Hand out a fresh, usable session.
    ///
    /// Once the pool is full the worst session (error score first, then
    /// usage) is evicted to make room.
    pub async fn get_session(&self, hostname: Option<&str>) -> Result<Session> {
        let mut state = self.state.lock().await;

        state.sessions.retain(|_, session| session.is_usable());

        if state.sessions.len() < self.config.max_pool_size {
            return Ok(self.create_session(&mut state, hostname));
        }

        let worst = state
            .sessions
            .values()
            .max_by_key(|s| s.badness())
            .map(|s| s.id.clone());

        if let Some(worst) = worst {
            state.sessions.remove(&worst);
            debug!("Evicted session {} to make room", worst);
        }

        Ok(self.create_session(&mut state, hostname))
    }

    fn create_session(&self, state: &mut PoolState, hostname: Option<&str>) -> Session {
        let user_agent = match hostname {
            Some(host) => state.user_agents.get_agent_for_domain(host),
            None => state.user_agents.random_agent(),
        };
        let proxy = state.proxies.get_proxy(hostname.unwrap_or("*"));
        let fingerprint = state.fingerprints.generate(&user_agent);

        let session = Session::new(
            hostname.map(str::to_string),
            user_agent,
            proxy,
            fingerprint.id,
            fingerprint.headers,
            self.config.max_error_score,
            self.config.max_usage_count,
        );

        debug!(
            "Created session {} for {}",
            session.id,
            hostname.unwrap_or("any host")
        );

        state.sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Record a successful use; lowers the error score (floor 0)
    pub async fn mark_good(&self, id: &str) {
        self.record_use(id, |session| {
            session.error_score = session.error_score.saturating_sub(1);
        })
        .await;
    }

    /// Record a failed use; the session is dropped once it crosses a limit
    pub async fn mark_bad(&self, id: &str) {
        self.record_use(id, |session| {
            session.error_score += 1;
        })
        .await;
    }

    async fn record_use(&self, id: &str, update: impl FnOnce(&mut Session)) {
        let mut state = self.state.lock().await;

        let retire = match state.sessions.get_mut(id) {
            Some(session) => {
                update(session);
                session.usage_count += 1;
                !session.is_usable()
            }
            None => false,
        };

        if retire {
            if let Some(session) = state.sessions.remove(id) {
                info!(
                    "Retired session {} (error score {}, used {} times)",
                    id, session.error_score, session.usage_count
                );
            }
        }
    }

    /// Drop a session immediately, e.g. after anti-bot detection
    pub async fn retire(&self, id: &str) {
        let mut state = self.state.lock().await;
        if state.sessions.remove(id).is_some() {
            info!("Retired blocked session {}", id);
        }
    }

    /// Persist cookies received on a response
    pub async fn update_cookies(&self, id: &str, set_cookie: &[String]) {
        let mut state = self.state.lock().await;
        if let Some(session) = state.sessions.get_mut(id) {
            session.set_cookies(set_cookie.iter().map(String::as_str));
        }
    }

    pub async fn mark_proxy_blocked(&self, proxy_url: &str) {
        self.state.lock().await.proxies.mark_blocked(proxy_url);
    }

    pub async fn reset_proxies(&self) {
        self.state.lock().await.proxies.reset_all();
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.state.lock().await.sessions.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    fn pool(max_pool_size: usize, max_error_score: u32) -> SessionPool {
        SessionPool::new(
            SessionPoolSettings {
                max_pool_size,
                max_error_score,
                max_usage_count: 1_000,
            },
            &IdentitySettings::default(),
            &ProxySettings::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_mark_bad_retires_session() {
        let pool = pool(5, 3);
        let session = pool.get_session(Some("example.com")).await.unwrap();

        for _ in 0..3 {
            pool.mark_bad(&session.id).await;
        }

        assert!(pool.get(&session.id).await.is_none());
        for _ in 0..20 {
            let next = pool.get_session(Some("example.com")).await.unwrap();
            assert_ne!(next.id, session.id);
        }
    }

    #[tokio::test]
    async fn test_mark_good_floors_at_zero() {
        let pool = pool(5, 3);
        let session = pool.get_session(None).await.unwrap();

        pool.mark_bad(&session.id).await;
        for _ in 0..10 {
            pool.mark_good(&session.id).await;
        }

        let stored = pool.get(&session.id).await.unwrap();
        assert_eq!(stored.error_score, 0);
        assert_eq!(stored.usage_count, 11);
    }

    #[tokio::test]
    async fn test_full_pool_replaces_instead_of_reusing() {
        let pool = pool(1, 3);
        let a = pool.get_session(Some("a.com")).await.unwrap();
        let b = pool.get_session(Some("a.com")).await.unwrap();
        let c = pool.get_session(None).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(b.id, c.id);
        assert_eq!(pool.len().await, 1);
        assert!(pool.get(&a.id).await.is_none());
        assert!(pool.get(&c.id).await.is_some());
    }

    #[tokio::test]
    async fn test_full_pool_evicts_worst() {
        let pool = pool(2, 5);
        let a = pool.get_session(Some("a.com")).await.unwrap();
        let b = pool.get_session(Some("b.com")).await.unwrap();
        pool.mark_bad(&a.id).await;
        pool.mark_bad(&a.id).await;
        pool.mark_good(&b.id).await;

        let c = pool.get_session(Some("c.com")).await.unwrap();

        assert_eq!(pool.len().await, 2);
        assert!(pool.get(&a.id).await.is_none());
        assert!(pool.get(&b.id).await.is_some());
        assert_eq!(c.hostname.as_deref(), Some("c.com"));
    }

    #[tokio::test]
    async fn test_usage_limit_retires() {
        let pool = SessionPool::new(
            SessionPoolSettings {
                max_pool_size: 3,
                max_error_score: 3,
                max_usage_count: 2,
            },
            &IdentitySettings::default(),
            &ProxySettings::default(),
        )
        .unwrap();

        let session = pool.get_session(None).await.unwrap();
        pool.mark_good(&session.id).await;
        pool.mark_good(&session.id).await;

        assert!(pool.get(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_handed_out_sessions_are_usable() {
        let pool = pool(3, 2);
        for i in 0..50 {
            let session = pool.get_session(Some("example.com")).await.unwrap();
            assert!(session.is_usable());
            if i % 2 == 0 {
                pool.mark_bad(&session.id).await;
            }
        }
    }

    #[tokio::test]
    async fn test_sessions_use_proxies_and_fingerprint_headers() {
        let proxy = ProxySettings {
            enabled: true,
            proxy_list: vec![ProxyConfig {
                name: "p1".to_string(),
                proxy_type: "http".to_string(),
                address: "10.0.0.1".to_string(),
                port: Some(3128),
                username: None,
                password: None,
            }],
        };
        let pool = SessionPool::new(
            SessionPoolSettings::default(),
            &IdentitySettings::default(),
            &proxy,
        )
        .unwrap();

        let session = pool.get_session(Some("example.com")).await.unwrap();
        assert_eq!(session.proxy.as_deref(), Some("http://10.0.0.1:3128"));
        assert_eq!(
            session.headers.get("User-Agent"),
            Some(&session.user_agent)
        );

        pool.mark_proxy_blocked("http://10.0.0.1:3128").await;
        let next = pool.get_session(Some("example.com")).await.unwrap();
        assert_eq!(next.proxy, None);
    }

    #[tokio::test]
    async fn test_update_cookies() {
        let pool = pool(2, 3);
        let session = pool.get_session(None).await.unwrap();
        pool.update_cookies(&session.id, &["sid=1; Path=/".to_string()]).await;

        let stored = pool.get(&session.id).await.unwrap();
        assert_eq!(stored.cookie_header().as_deref(), Some("sid=1"));
    }
}
