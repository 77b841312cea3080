//! Capa de coordinación compartida entre workers.
//!
//! `SharedStorage` es un handle explícito (no un singleton global) que se
//! inicializa una vez por grupo de procesos y se cierra con `finalize`.
//! Contiene:
//!   - namespaces compartidos (estado de documentos, cachés, estado del
//!     pipeline), cada uno con su propio lock;
//!   - locks por documento con caducidad, para recuperarse de un worker caído;
//!   - locks por clave (entidades y aristas) para el merge del grafo.

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RagError, RagResult};
use crate::utils::now_iso;

pub const PIPELINE_STATUS_NAMESPACE: &str = "pipeline_status";
const MAX_HISTORY_MESSAGES: usize = 1000;

/// Estado observable del pipeline de ingesta.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatus {
    pub is_busy: bool,
    pub job_name: String,
    pub docs: usize,
    pub processed_docs: usize,
    pub message: String,
    /// Valor entre 0.0 y 1.0
    pub progress: f32,
    /// Otra petición de procesado llegó mientras el pipeline estaba ocupado.
    pub request_pending: bool,
    pub updated_at: String,
    pub history_messages: Vec<String>,
}

impl PipelineStatus {
    pub fn push_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.message = message.clone();
        self.updated_at = now_iso();
        self.history_messages.push(message);
        if self.history_messages.len() > MAX_HISTORY_MESSAGES {
            let overflow = self.history_messages.len() - MAX_HISTORY_MESSAGES;
            self.history_messages.drain(..overflow);
        }
    }
}

/// Un namespace compartido. Toda mutación pasa por su lock.
pub struct Namespace<T> {
    name: String,
    data: AsyncMutex<T>,
    dirty: AtomicBool,
}

impl<T> Namespace<T> {
    fn new(name: &str, value: T) -> Self {
        Self {
            name: name.to_string(),
            data: AsyncMutex::new(value),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self) -> MutexGuard<'_, T> {
        self.data.lock().await
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Devuelve y limpia el indicador de cambios pendientes de persistir.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}

struct LockEntry {
    owner: Uuid,
    expires_at: Instant,
}

struct SharedInner {
    workers: usize,
    finalized: AtomicBool,
    namespaces: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    doc_locks: Mutex<HashMap<String, LockEntry>>,
    keyed_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

#[derive(Clone)]
pub struct SharedStorage {
    inner: Arc<SharedInner>,
}

impl std::fmt::Debug for SharedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStorage")
            .field("workers", &self.inner.workers)
            .field("finalized", &self.inner.finalized.load(Ordering::SeqCst))
            .finish()
    }
}

impl SharedStorage {
    /// Inicializa la capa compartida para `workers` workers y crea el
    /// namespace del estado del pipeline.
    pub fn initialize(workers: usize) -> Self {
        let shared = Self {
            inner: Arc::new(SharedInner {
                workers: workers.max(1),
                finalized: AtomicBool::new(false),
                namespaces: Mutex::new(HashMap::new()),
                doc_locks: Mutex::new(HashMap::new()),
                keyed_locks: Mutex::new(HashMap::new()),
            }),
        };
        let status: Arc<dyn Any + Send + Sync> = Arc::new(Namespace::new(
            PIPELINE_STATUS_NAMESPACE,
            PipelineStatus::default(),
        ));
        if let Ok(mut map) = shared.inner.namespaces.lock() {
            map.insert(PIPELINE_STATUS_NAMESPACE.to_string(), status);
        }
        info!("Almacenamiento compartido inicializado ({} workers).", shared.inner.workers);
        shared
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::SeqCst)
    }

    /// Libera namespaces y locks. Tras esto cualquier acceso a un namespace
    /// devuelve error.
    pub fn finalize(&self) {
        self.inner.finalized.store(true, Ordering::SeqCst);
        if let Ok(mut map) = self.inner.namespaces.lock() {
            map.clear();
        }
        if let Ok(mut locks) = self.inner.doc_locks.lock() {
            locks.clear();
        }
        if let Ok(mut locks) = self.inner.keyed_locks.lock() {
            locks.clear();
        }
        info!("Almacenamiento compartido finalizado.");
    }

    /// Devuelve el namespace `name`, creándolo con `init` si no existe.
    /// Si ya existe con otro tipo de dato, es un error.
    pub fn namespace_with<T, F>(&self, name: &str, init: F) -> RagResult<Arc<Namespace<T>>>
    where
        T: Send + 'static,
        F: FnOnce() -> T,
    {
        if self.is_finalized() {
            return Err(RagError::Storage(format!(
                "shared storage already finalized (namespace '{name}')"
            )));
        }
        let mut map = self
            .inner
            .namespaces
            .lock()
            .map_err(|_| RagError::Storage("shared namespace map poisoned".into()))?;
        let entry = map
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Namespace::new(name, init())) as Arc<dyn Any + Send + Sync>)
            .clone();
        entry.downcast::<Namespace<T>>().map_err(|_| {
            RagError::Storage(format!("namespace '{name}' already holds another data type"))
        })
    }

    pub fn namespace<T>(&self, name: &str) -> RagResult<Arc<Namespace<T>>>
    where
        T: Default + Send + 'static,
    {
        self.namespace_with(name, T::default)
    }

    pub fn pipeline_status(&self) -> RagResult<Arc<Namespace<PipelineStatus>>> {
        self.namespace::<PipelineStatus>(PIPELINE_STATUS_NAMESPACE)
    }

    /// Intenta reservar el documento `doc_id`. Devuelve `None` si otro worker
    /// tiene un lock vigente; un lock caducado se considera abandonado.
    pub fn try_lock_doc(&self, doc_id: &str, ttl: Duration) -> Option<DocLockGuard> {
        let mut locks = self.inner.doc_locks.lock().ok()?;
        let now = Instant::now();
        if let Some(entry) = locks.get(doc_id) {
            if entry.expires_at > now {
                return None;
            }
            warn!("Lock caducado del documento {doc_id}; se reclama.");
        }
        let owner = Uuid::new_v4();
        locks.insert(
            doc_id.to_string(),
            LockEntry {
                owner,
                expires_at: now + ttl,
            },
        );
        debug!("Documento {doc_id} reservado por {owner}.");
        Some(DocLockGuard {
            inner: self.inner.clone(),
            doc_id: doc_id.to_string(),
            owner,
        })
    }

    pub fn is_doc_locked(&self, doc_id: &str) -> bool {
        self.inner
            .doc_locks
            .lock()
            .map(|locks| {
                locks
                    .get(doc_id)
                    .is_some_and(|entry| entry.expires_at > Instant::now())
            })
            .unwrap_or(false)
    }

    /// Adquiere, en orden, un lock por cada clave de `namespace`. El orden
    /// fijo evita interbloqueos entre merges concurrentes.
    pub async fn lock_keys<I, S>(&self, namespace: &str, keys: I) -> RagResult<KeyedLockGuard>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ordered: BTreeSet<String> = keys
            .into_iter()
            .map(|k| format!("{namespace}:{}", k.as_ref()))
            .collect();
        let mut guards = Vec::with_capacity(ordered.len());
        let mut held = Vec::with_capacity(ordered.len());
        for key in ordered {
            let mutex = {
                let mut locks = self
                    .inner
                    .keyed_locks
                    .lock()
                    .map_err(|_| RagError::Storage("keyed lock map poisoned".into()))?;
                locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                    .clone()
            };
            guards.push(mutex.lock_owned().await);
            held.push(key);
        }
        Ok(KeyedLockGuard {
            inner: self.inner.clone(),
            keys: held,
            guards,
        })
    }
}

/// Lock de un documento en PROCESSING. Se libera al soltarlo.
pub struct DocLockGuard {
    inner: Arc<SharedInner>,
    doc_id: String,
    owner: Uuid,
}

impl DocLockGuard {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Extiende la caducidad mientras el documento sigue en curso.
    pub fn refresh(&self, ttl: Duration) -> RagResult<()> {
        let mut locks = self
            .inner
            .doc_locks
            .lock()
            .map_err(|_| RagError::Storage("document lock map poisoned".into()))?;
        match locks.get_mut(&self.doc_id) {
            Some(entry) if entry.owner == self.owner => {
                entry.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(RagError::LockTimeout(format!(
                "lock on document {} was lost",
                self.doc_id
            ))),
        }
    }
}

impl Drop for DocLockGuard {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.inner.doc_locks.lock() {
            if locks
                .get(&self.doc_id)
                .is_some_and(|entry| entry.owner == self.owner)
            {
                locks.remove(&self.doc_id);
            }
        }
    }
}

/// Locks por clave adquiridos con `lock_keys`. Al soltarse, las entradas que
/// ya nadie usa salen del mapa.
pub struct KeyedLockGuard {
    inner: Arc<SharedInner>,
    keys: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for KeyedLockGuard {
    fn drop(&mut self) {
        self.guards.clear();
        if let Ok(mut locks) = self.inner.keyed_locks.lock() {
            for key in &self.keys {
                // Sólo queda la referencia del mapa: nadie espera ni retiene la clave.
                if locks.get(key).is_some_and(|m| Arc::strong_count(m) == 1) {
                    locks.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[tokio::test]
    async fn namespace_is_shared_between_handles() {
        let shared = SharedStorage::initialize(2);
        let a = shared.namespace::<StdHashMap<String, u32>>("cache").unwrap();
        a.lock().await.insert("k".into(), 1);
        let b = shared.namespace::<StdHashMap<String, u32>>("cache").unwrap();
        assert_eq!(b.lock().await.get("k"), Some(&1));
    }

    #[tokio::test]
    async fn namespace_type_mismatch_is_an_error() {
        let shared = SharedStorage::initialize(1);
        shared.namespace::<Vec<u8>>("ns").unwrap();
        assert!(shared.namespace::<String>("ns").is_err());
    }

    #[tokio::test]
    async fn finalize_tears_down_namespaces() {
        let shared = SharedStorage::initialize(1);
        shared.namespace::<Vec<u8>>("ns").unwrap();
        shared.finalize();
        assert!(shared.namespace::<Vec<u8>>("ns").is_err());
        assert!(shared.pipeline_status().is_err());
    }

    #[test]
    fn doc_lock_is_exclusive_until_dropped() {
        let shared = SharedStorage::initialize(1);
        let guard = shared.try_lock_doc("doc-1", Duration::from_secs(60)).unwrap();
        assert!(shared.try_lock_doc("doc-1", Duration::from_secs(60)).is_none());
        assert!(shared.is_doc_locked("doc-1"));
        drop(guard);
        assert!(!shared.is_doc_locked("doc-1"));
        assert!(shared.try_lock_doc("doc-1", Duration::from_secs(60)).is_some());
    }

    #[test]
    fn expired_doc_lock_can_be_reclaimed() {
        let shared = SharedStorage::initialize(1);
        let stale = shared.try_lock_doc("doc-1", Duration::from_millis(0)).unwrap();
        let fresh = shared.try_lock_doc("doc-1", Duration::from_secs(60));
        assert!(fresh.is_some());
        // the stale owner no longer holds the lock
        assert!(stale.refresh(Duration::from_secs(1)).is_err());
        drop(stale);
        assert!(shared.is_doc_locked("doc-1"));
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let shared = SharedStorage::initialize(1);
        let guard = shared.lock_keys("graph", ["Alice"]).await.unwrap();
        let contender = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.lock_keys("graph", ["Alice"]).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn released_keyed_locks_leave_the_map() {
        let shared = SharedStorage::initialize(1);
        let guard = shared.lock_keys("graph", ["Alice", "Bob"]).await.unwrap();
        assert_eq!(shared.inner.keyed_locks.lock().unwrap().len(), 2);

        let contender = {
            let shared = shared.clone();
            tokio::spawn(async move {
                let _held = shared.lock_keys("graph", ["Alice"]).await?;
                tokio::time::sleep(Duration::from_millis(10)).await;
                RagResult::Ok(())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        // La clave con un contendiente sigue viva mientras éste la use.
        contender.await.unwrap().unwrap();
        assert!(shared.inner.keyed_locks.lock().unwrap().is_empty());
    }
}
