// StorageFacade: the single entry point into the vault
//
// Lifecycle: Uninitialized → Initializing → Ready, or Degraded when any
// bootstrap step fails. Initialization runs lazily on the first call and is
// serialized so concurrent callers share one key and one set of stores.
//
// In Degraded, reads answer with empty results and writes fail fast with
// `VaultError::Initialization`.

use crate::backup::{BackupExchange, ExportReport, ImportReport, Snapshot};
use crate::config::StorageConfig;
use crate::crypto::{DataKey, KeyManager, RecordCodec};
use crate::model::{Conversation, ListQuery, Listing, Message, Page, ReencryptReport, StorageStats};
use crate::store::backend::{SledStorage, StorageBackend, WriteOp};
use crate::store::layout::{CONVERSATION_PREFIX, DATA_KEY, MESSAGE_PREFIX, SCHEMA_VERSION_KEY};
use crate::store::settings::{Settings, SettingsPatch, SettingsStore};
use crate::store::{commit, ConversationStore, MessageStore, STORAGE_SCHEMA_VERSION};
use crate::VaultError;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    Uninitialized,
    Initializing,
    Ready,
    Degraded,
}

enum BackendSource {
    Injected(Arc<dyn StorageBackend>),
    Path(PathBuf),
}

enum FacadeState {
    Uninitialized,
    Initializing,
    Ready(Arc<Engine>),
    Degraded(String),
}

/// Everything that exists once bootstrap succeeded.
struct Engine {
    backend: Arc<dyn StorageBackend>,
    key: Arc<DataKey>,
    settings: SettingsStore,
    conversations: ConversationStore,
    messages: MessageStore,
    backup: BackupExchange,
}

fn read_schema_version(backend: &dyn StorageBackend) -> Result<Option<u32>, VaultError> {
    let Some(bytes) = backend
        .get(SCHEMA_VERSION_KEY)
        .map_err(VaultError::Storage)?
    else {
        return Ok(None);
    };
    let text = String::from_utf8(bytes)
        .map_err(|_| VaultError::Initialization("schema version is not UTF-8".to_string()))?;
    text.trim()
        .parse::<u32>()
        .map(Some)
        .map_err(|_| VaultError::Initialization(format!("malformed schema version {:?}", text)))
}

fn open_backend(source: &BackendSource) -> Result<Arc<dyn StorageBackend>, VaultError> {
    match source {
        BackendSource::Injected(backend) => Ok(backend.clone()),
        BackendSource::Path(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    VaultError::Initialization(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
            let backend = SledStorage::open(path).map_err(VaultError::Initialization)?;
            Ok(Arc::new(backend))
        }
    }
}

fn bootstrap(source: &BackendSource, defaults: &Settings) -> Result<Engine, VaultError> {
    let backend = open_backend(source)?;

    let version = read_schema_version(backend.as_ref())?;
    if let Some(found) = version {
        if found > STORAGE_SCHEMA_VERSION {
            return Err(VaultError::Initialization(format!(
                "schema version {} is newer than supported version {}",
                found, STORAGE_SCHEMA_VERSION
            )));
        }
    }

    let settings = SettingsStore::new(backend.clone(), defaults.clone());
    let keys = KeyManager::new(backend.clone(), settings.clone());
    let key = keys.get_or_create_key()?;
    let codec = Arc::new(RecordCodec::new(key.clone()));

    let conversations = ConversationStore::new(backend.clone(), codec.clone(), settings.clone());
    let messages = MessageStore::new(backend.clone(), codec, settings.clone());
    let backup = BackupExchange::new(conversations.clone(), messages.clone(), settings.clone());

    let has_records = backend
        .count_prefix(CONVERSATION_PREFIX)
        .map_err(VaultError::Storage)?
        > 0
        || backend.count_prefix(MESSAGE_PREFIX).map_err(VaultError::Storage)? > 0;
    if version.is_none() && has_records {
        let mut ops = conversations.rebuild_index_ops()?;
        ops.extend(messages.rebuild_index_ops()?);
        tracing::info!(entries = ops.len(), "Rebuilding indexes of unversioned store");
        commit(backend.as_ref(), ops)?;
    }

    if version != Some(STORAGE_SCHEMA_VERSION) {
        commit(
            backend.as_ref(),
            vec![WriteOp::put(
                SCHEMA_VERSION_KEY,
                STORAGE_SCHEMA_VERSION.to_string(),
            )],
        )?;
    }

    Ok(Engine {
        backend,
        key,
        settings,
        conversations,
        messages,
        backup,
    })
}

pub struct StorageFacade {
    source: BackendSource,
    defaults: Settings,
    init_lock: tokio::sync::Mutex<()>,
    state: RwLock<FacadeState>,
}

impl StorageFacade {
    /// Facade over a sled database under `config.data_dir`.
    pub fn new(config: StorageConfig) -> Self {
        Self::from_source(
            BackendSource::Path(config.database_path()),
            config.default_settings(),
        )
    }

    /// Facade over an already-open backend.
    pub fn with_backend(backend: Arc<dyn StorageBackend>, defaults: Settings) -> Self {
        Self::from_source(BackendSource::Injected(backend), defaults)
    }

    fn from_source(source: BackendSource, defaults: Settings) -> Self {
        Self {
            source,
            defaults,
            init_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(FacadeState::Uninitialized),
        }
    }

    pub fn state(&self) -> StorageState {
        match &*self.state.read() {
            FacadeState::Uninitialized => StorageState::Uninitialized,
            FacadeState::Initializing => StorageState::Initializing,
            FacadeState::Ready(_) => StorageState::Ready,
            FacadeState::Degraded(_) => StorageState::Degraded,
        }
    }

    /// Run initialization now instead of on first use.
    pub async fn initialize(&self) -> Result<(), VaultError> {
        self.write_engine().await.map(|_| ())
    }

    /// `Some` once initialization has finished, either way.
    fn settled(&self) -> Option<Option<Arc<Engine>>> {
        match &*self.state.read() {
            FacadeState::Ready(engine) => Some(Some(engine.clone())),
            FacadeState::Degraded(_) => Some(None),
            FacadeState::Uninitialized | FacadeState::Initializing => None,
        }
    }

    /// The engine, `None` when degraded. Only the call that runs a failing
    /// bootstrap receives its error.
    async fn engine(&self) -> Result<Option<Arc<Engine>>, VaultError> {
        if let Some(engine) = self.settled() {
            return Ok(engine);
        }

        let _guard = self.init_lock.lock().await;
        if let Some(engine) = self.settled() {
            return Ok(engine);
        }

        *self.state.write() = FacadeState::Initializing;
        tracing::info!("🗄️ Initializing storage");
        match bootstrap(&self.source, &self.defaults) {
            Ok(engine) => {
                let engine = Arc::new(engine);
                *self.state.write() = FacadeState::Ready(engine.clone());
                tracing::info!("🗄️ Storage ready");
                Ok(Some(engine))
            }
            Err(e) => {
                let reason = match e {
                    VaultError::Initialization(reason) => reason,
                    other => other.to_string(),
                };
                tracing::error!(reason = %reason, "Storage initialization failed, running degraded");
                *self.state.write() = FacadeState::Degraded(reason.clone());
                Err(VaultError::Initialization(reason))
            }
        }
    }

    async fn write_engine(&self) -> Result<Arc<Engine>, VaultError> {
        match self.engine().await? {
            Some(engine) => Ok(engine),
            None => {
                let reason = match &*self.state.read() {
                    FacadeState::Degraded(reason) => reason.clone(),
                    _ => "storage unavailable".to_string(),
                };
                Err(VaultError::Initialization(reason))
            }
        }
    }

    // ------------------------------------------------------------------------
    // CONVERSATIONS
    // ------------------------------------------------------------------------

    pub async fn store_conversation(&self, conversation: Conversation) -> Result<Conversation, VaultError> {
        self.write_engine().await?.conversations.put(conversation)
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, VaultError> {
        match self.engine().await? {
            Some(engine) => engine.conversations.get(id),
            None => Ok(None),
        }
    }

    pub async fn list_conversations(&self, query: &ListQuery) -> Result<Page<Conversation>, VaultError> {
        match self.engine().await? {
            Some(engine) => engine.conversations.list(query),
            None => Ok(Page::empty()),
        }
    }

    pub async fn list_conversations_by_endpoint(
        &self,
        endpoint: &str,
    ) -> Result<Listing<Conversation>, VaultError> {
        match self.engine().await? {
            Some(engine) => engine.conversations.list_by_endpoint(endpoint),
            None => Ok(Listing::default()),
        }
    }

    /// Delete a conversation with all of its messages.
    pub async fn delete_conversation(&self, id: &str) -> Result<bool, VaultError> {
        self.write_engine().await?.conversations.delete(id)
    }

    // ------------------------------------------------------------------------
    // MESSAGES
    // ------------------------------------------------------------------------

    pub async fn store_message(&self, message: Message) -> Result<Message, VaultError> {
        self.write_engine().await?.messages.put(message)
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<Message>, VaultError> {
        match self.engine().await? {
            Some(engine) => engine.messages.get(id),
            None => Ok(None),
        }
    }

    /// Messages of a conversation in creation order. Undecryptable messages
    /// are left out.
    pub async fn list_messages_by_conversation(&self, conversation_id: &str) -> Result<Vec<Message>, VaultError> {
        match self.engine().await? {
            Some(engine) => Ok(engine.messages.list_by_conversation(conversation_id)?.items),
            None => Ok(Vec::new()),
        }
    }

    // ------------------------------------------------------------------------
    // SETTINGS
    // ------------------------------------------------------------------------

    pub async fn get_settings(&self) -> Result<Settings, VaultError> {
        match self.engine().await? {
            Some(engine) => engine.settings.get(),
            None => Ok(self.defaults.clone()),
        }
    }

    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<Settings, VaultError> {
        self.write_engine().await?.settings.update(patch)
    }

    // ------------------------------------------------------------------------
    // BACKUP & MAINTENANCE
    // ------------------------------------------------------------------------

    /// Export needs a ready store: an empty snapshot from a degraded store
    /// would overwrite a good backup.
    pub async fn export_all(&self) -> Result<ExportReport, VaultError> {
        self.write_engine().await?.backup.export_all()
    }

    pub async fn import_all(&self, snapshot: &Snapshot) -> Result<ImportReport, VaultError> {
        self.write_engine().await?.backup.import_all(snapshot)
    }

    /// Remove every record and re-seed default settings in one batch.
    /// The data key survives, so its hash is carried into the new settings.
    pub async fn clear_all(&self) -> Result<(), VaultError> {
        let engine = self.write_engine().await?;
        let mut ops: Vec<WriteOp> = engine
            .backend
            .scan_prefix(b"")
            .map_err(VaultError::Storage)?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.as_slice() != DATA_KEY && key.as_slice() != SCHEMA_VERSION_KEY)
            .map(WriteOp::delete)
            .collect();

        let mut settings = engine.settings.defaults().clone();
        settings.key_hash = Some(engine.key.fingerprint());
        ops.push(engine.settings.write_op(&settings)?);

        commit(engine.backend.as_ref(), ops)?;
        engine.backend.flush().map_err(VaultError::Storage)?;
        tracing::info!("🧹 Storage cleared");
        Ok(())
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats, VaultError> {
        match self.engine().await? {
            Some(engine) => Ok(StorageStats {
                conversation_count: engine.conversations.count()?,
                message_count: engine.messages.count()?,
                estimated_size_bytes: engine.backend.used_bytes(),
            }),
            None => Ok(StorageStats::default()),
        }
    }

    /// Rewrite every readable record under the current encryption flag.
    /// A record that cannot be rewritten keeps its previous form and is
    /// counted in `failed`.
    pub async fn reencrypt_all(&self) -> Result<ReencryptReport, VaultError> {
        let engine = self.write_engine().await?;
        let mut report = ReencryptReport::default();
        for conversation in engine.conversations.all()?.items {
            let result = engine.conversations.restore(&conversation);
            report.record("conversation", &conversation.id, result);
        }
        for message in engine.messages.all()?.items {
            let result = engine.messages.restore(&message);
            report.record("message", &message.id, result);
        }
        tracing::info!(
            rewritten = report.rewritten,
            failed = report.failed,
            "🔐 Re-encrypted records"
        );
        Ok(report)
    }

    /// Flush pending writes to disk.
    pub async fn flush(&self) -> Result<(), VaultError> {
        match self.engine().await? {
            Some(engine) => engine.backend.flush().map_err(VaultError::Storage),
            None => Ok(()),
        }
    }
}
