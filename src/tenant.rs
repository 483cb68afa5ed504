use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::config::PolicyConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::outbox::{self, Collaborators, Outbox};
use crate::reaper;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL +
/// outbox dispatcher + background sweeps. Tenant = database name from the
/// pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    hubs: DashMap<String, Arc<NotifyHub>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    policy: PolicyConfig,
    collaborators: Option<Collaborators>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, policy: PolicyConfig) -> Self {
        Self {
            engines: DashMap::new(),
            hubs: DashMap::new(),
            data_dir,
            compact_threshold,
            policy,
            collaborators: None,
        }
    }

    /// Deliver every tenant's side effects to these collaborators instead of
    /// the in-process hub.
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    /// The in-process notification hub for a tenant, when it uses the default
    /// collaborators.
    pub fn notify_hub(&self, tenant: &str) -> Option<Arc<NotifyHub>> {
        self.hubs.get(tenant).map(|h| h.value().clone())
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }
        // The entry guard serializes concurrent first connections to one tenant.
        let entry = match self.engines.entry(tenant.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(e) => e,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let (outbox, outbox_rx) = Outbox::channel();
        let engine = Arc::new(Engine::new(wal_path, outbox, self.policy.clone())?);

        let collaborators = match &self.collaborators {
            Some(c) => c.clone(),
            None => {
                let hub = Arc::new(NotifyHub::new());
                self.hubs.insert(tenant.to_string(), hub.clone());
                Collaborators::local(hub)
            }
        };
        tokio::spawn(outbox::run_dispatcher(
            outbox_rx,
            Arc::downgrade(&engine),
            collaborators,
        ));
        tokio::spawn(reaper::run_pass_expiry(engine.clone()));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("tenant {safe_name} loaded");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use ulid::Ulid;
    use crate::model::*;
    use crate::notify::Notification;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("studiodb_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, PolicyConfig::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same ids in both tenants
        let room = Ulid::new();
        let staff = Ulid::new();
        for eng in [&eng_a, &eng_b] {
            eng.create_room(room, None).await.unwrap();
            eng.create_staff(staff, None).await.unwrap();
        }

        let start = 2_000_000_000_000;
        let span = Span::new(start, start + HOUR_MS);
        eng_a
            .create_session(crate::engine::SessionInput {
                id: Ulid::new(),
                room_id: room,
                staff_id: staff,
                client_id: None,
                span,
            })
            .await
            .unwrap();

        let in_b = eng_b.check_conflict(ResourceKind::Room, room, span, None).await.unwrap();
        assert!(!in_b.conflict);
        let in_a = eng_a.check_conflict(ResourceKind::Room, room, span, None).await.unwrap();
        assert!(in_a.conflict);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = manager(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn tenant_notifications_reach_hub() {
        let dir = test_data_dir("hub");
        let tm = manager(dir);
        let eng = tm.get_or_create("studio").unwrap();
        let hub = tm.notify_hub("studio").unwrap();

        let room = Ulid::new();
        let trainer = Ulid::new();
        let client = Ulid::new();
        eng.create_room(room, None).await.unwrap();
        eng.create_staff(trainer, None).await.unwrap();
        eng.create_client(client, None).await.unwrap();
        let start = 2_000_000_000_000;
        let class = Ulid::new();
        eng.create_class(crate::engine::ClassInput {
            id: class,
            room_id: room,
            trainer_id: trainer,
            name: None,
            span: Span::new(start, start + HOUR_MS),
            capacity: 5,
            price_cents: 1500,
            credits_required: None,
        })
        .await
        .unwrap();

        let mut inbox = hub.subscribe(client);
        eng.book_class(class, client, Actor::member(client)).await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(n, Notification::BookingConfirmed { payment_status: PaymentStatus::Unpaid, .. }));
    }
}
