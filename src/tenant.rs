use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use crate::engine::Engine;
use crate::limits::*;
use crate::model::Ms;
use crate::notify::NotifyHub;
use crate::reaper;

/// Per-business engines, keyed by the pgwire database name.
/// Each business gets its own Engine, WAL file, reaper and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Held while opening a new engine so one WAL never gets two writers.
    create_lock: Mutex<()>,
    data_dir: PathBuf,
    compact_threshold: u64,
    hold_ttl_ms: Ms,
    reaper_interval: Duration,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        hold_ttl_ms: Ms,
        reaper_interval: Duration,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            create_lock: Mutex::new(()),
            data_dir,
            compact_threshold,
            hold_ttl_ms,
            reaper_interval,
        }
    }

    /// Checkout hold lifetime used when a client does not pick one.
    pub fn hold_ttl_ms(&self) -> Ms {
        self.hold_ttl_ms
    }

    /// Get or lazily open the engine for a business.
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
        if tenant.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        // The WAL file is named after the business, so two names must never
        // map to one file.
        if sanitize(tenant) != tenant {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name may only contain letters, digits, '_' and '-'",
            ));
        }

        let _creating = self.create_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let wal_path = self.data_dir.join(format!("{tenant}.wal"));
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);

        tokio::spawn(reaper::run_reaper(engine.clone(), self.reaper_interval));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        self.engines.insert(tenant.to_string(), engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened business {tenant:?}");
        Ok(engine)
    }
}

/// The characters of a name that are safe in a file name.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("boxoffice_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, 600_000, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let eng_a = tm.get_or_create("riverside_tours").unwrap();
        let eng_b = tm.get_or_create("city_museum").unwrap();

        // Same id in both businesses.
        let id = Ulid::new();
        eng_a
            .create_experience(id, "Boat trip".into(), None, ExperienceStatus::Published)
            .await
            .unwrap();
        eng_b
            .create_experience(id, "Exhibit".into(), None, ExperienceStatus::Draft)
            .await
            .unwrap();

        assert_eq!(eng_a.list_experiences(None)[0].name, "Boat trip");
        assert_eq!(eng_b.list_experiences(None)[0].name, "Exhibit");

        eng_a.delete_experience(id).await.unwrap();
        assert!(eng_a.list_experiences(None).is_empty());
        assert_eq!(eng_b.list_experiences(None).len(), 1);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_reopen_replays_wal() {
        let dir = test_data_dir("reopen");
        let id = Ulid::new();
        {
            let tm = manager(dir.clone());
            let eng = tm.get_or_create("shop").unwrap();
            eng.create_experience(id, "Tasting".into(), None, ExperienceStatus::Draft)
                .await
                .unwrap();
        }
        let tm = manager(dir);
        let eng = tm.get_or_create("shop").unwrap();
        assert_eq!(eng.list_experiences(None)[0].id, id);
    }

    #[tokio::test]
    async fn tenant_name_must_be_path_safe() {
        let dir = test_data_dir("path_safe");
        let tm = manager(dir.clone());

        assert!(tm.get_or_create("../evil").is_err());
        assert!(tm.get_or_create("../..").is_err());
        assert!(tm.get_or_create("").is_err());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn names_differing_by_stripped_chars_stay_apart() {
        let dir = test_data_dir("no_alias");
        let id = Ulid::new();
        {
            let tm = manager(dir.clone());
            assert!(tm.get_or_create("acme.tours").is_err());
            let eng = tm.get_or_create("acmetours").unwrap();
            eng.create_experience(id, "Private tour".into(), None, ExperienceStatus::Draft)
                .await
                .unwrap();
        }
        let tm = manager(dir.clone());
        assert!(tm.get_or_create("acme.tours").is_err());
        assert!(tm.get_or_create("acme tours").is_err());
        assert_eq!(tm.get_or_create("acmetours").unwrap().list_experiences(None)[0].id, id);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = manager(test_data_dir("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize("acme-tours_2"), "acme-tours_2");
        assert_eq!(sanitize("a/b\\c.d e"), "abcde");
    }
}
