//! Durable profile stores for DIP: in-memory, JSON-file and PostgreSQL.
//!
//! Every store is an upsert keyed by domain with compare-and-swap on
//! `DomainProfile::revision`: a write of revision `r` succeeds only when the
//! stored revision is `r - 1` (or the domain is absent and `r == 1`).
//! Replaying an identical write is accepted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use dip_core::DomainProfile;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dip-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("revision conflict for {domain}: write expects stored revision {expected}, found {found}")]
    Conflict {
        domain: String,
        expected: u64,
        found: u64,
    },
    #[error("profile serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, domain: &str) -> Result<Option<DomainProfile>, StoreError>;

    async fn save_profile(&self, profile: &DomainProfile) -> Result<(), StoreError>;

    async fn list_domains(&self) -> Result<Vec<String>, StoreError>;
}

/// Shared CAS rule. `stored` is what the store currently holds for the domain.
fn check_revision(profile: &DomainProfile, stored: Option<&DomainProfile>) -> Result<WriteDecision, StoreError> {
    let found = stored.map(|p| p.revision).unwrap_or(0);
    if profile.revision == found + 1 {
        return Ok(WriteDecision::Write);
    }
    if let Some(stored) = stored {
        if stored.revision == profile.revision && stored == profile {
            return Ok(WriteDecision::AlreadyStored);
        }
    }
    Err(StoreError::Conflict {
        domain: profile.domain.clone(),
        expected: profile.revision.saturating_sub(1),
        found,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteDecision {
    Write,
    AlreadyStored,
}

#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: RwLock<HashMap<String, DomainProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.profiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.profiles.read().await.is_empty()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get_profile(&self, domain: &str) -> Result<Option<DomainProfile>, StoreError> {
        Ok(self.profiles.read().await.get(domain).cloned())
    }

    async fn save_profile(&self, profile: &DomainProfile) -> Result<(), StoreError> {
        let mut profiles = self.profiles.write().await;
        if check_revision(profile, profiles.get(&profile.domain))? == WriteDecision::Write {
            profiles.insert(profile.domain.clone(), profile.clone());
        }
        Ok(())
    }

    async fn list_domains(&self) -> Result<Vec<String>, StoreError> {
        let mut domains: Vec<String> = self.profiles.read().await.keys().cloned().collect();
        domains.sort();
        Ok(domains)
    }
}

/// One pretty-printed JSON document per domain under `root`, addressed by the
/// SHA-256 of the domain. Writes go through a temp file and an atomic rename.
#[derive(Debug)]
pub struct FileProfileStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileProfileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn profile_path(&self, domain: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", Self::sha256_hex(domain.as_bytes())))
    }

    async fn read_profile_file(path: &Path) -> anyhow::Result<Option<DomainProfile>> {
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking profile path {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading profile {}", path.display()))?;
        let profile = serde_json::from_str(&text)
            .with_context(|| format!("parsing profile {}", path.display()))?;
        Ok(Some(profile))
    }

    async fn save_locked(&self, profile: &DomainProfile) -> Result<(), StoreError> {
        let path = self.profile_path(&profile.domain);
        let _guard = self.write_lock.lock().await;
        let stored = Self::read_profile_file(&path).await?;
        if check_revision(profile, stored.as_ref())? == WriteDecision::AlreadyStored {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(profile)?;
        self.write_atomically(&path, &bytes).await?;
        debug!(path = %path.display(), "profile written");
        Ok(())
    }

    async fn write_atomically(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating profile directory {}", self.root.display()))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp profile file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp profile file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp profile file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp profile {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for FileProfileStore {
    async fn get_profile(&self, domain: &str) -> Result<Option<DomainProfile>, StoreError> {
        Ok(Self::read_profile_file(&self.profile_path(domain)).await?)
    }

    async fn save_profile(&self, profile: &DomainProfile) -> Result<(), StoreError> {
        let span = info_span!("file_store_save", domain = %profile.domain, revision = profile.revision);
        self.save_locked(profile).instrument(span).await
    }

    async fn list_domains(&self) -> Result<Vec<String>, StoreError> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking profile directory {}", self.root.display()))?
        {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading profile directory {}", self.root.display()))?;
        let mut domains = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            let path = entry.path();
            let is_profile = path.extension().and_then(|e| e.to_str()) == Some("json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_profile {
                continue;
            }
            if let Some(profile) = Self::read_profile_file(&path).await? {
                domains.push(profile.domain);
            }
        }
        domains.sort();
        Ok(domains)
    }
}

#[derive(Debug, Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running dip migrations")
    }

    async fn fetch(&self, domain: &str) -> Result<Option<DomainProfile>, StoreError> {
        let row = sqlx::query("SELECT data FROM dip_profiles WHERE domain = $1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: sqlx::types::Json<DomainProfile> = row.try_get("data")?;
                Ok(Some(data.0))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn get_profile(&self, domain: &str) -> Result<Option<DomainProfile>, StoreError> {
        self.fetch(domain).await
    }

    async fn save_profile(&self, profile: &DomainProfile) -> Result<(), StoreError> {
        let revision = i64::try_from(profile.revision)
            .map_err(|_| anyhow::anyhow!("revision {} out of range", profile.revision))?;
        let data = sqlx::types::Json(profile);

        let result = if profile.revision == 1 {
            sqlx::query(
                r#"
                INSERT INTO dip_profiles (domain, id, revision, data, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (domain) DO NOTHING
                "#,
            )
            .bind(&profile.domain)
            .bind(profile.id)
            .bind(revision)
            .bind(&data)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE dip_profiles
                   SET id = $2, revision = $3, data = $4, updated_at = $5
                 WHERE domain = $1 AND revision = $3 - 1
                "#,
            )
            .bind(&profile.domain)
            .bind(profile.id)
            .bind(revision)
            .bind(&data)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let stored = self.fetch(&profile.domain).await?;
        check_revision(profile, stored.as_ref()).map(|_| ())
    }

    async fn list_domains(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT domain FROM dip_profiles ORDER BY domain")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("domain")?);
        }
        Ok(out)
    }
}
