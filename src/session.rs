//! Estado por pestaña del navegador: historial de chat y caché de motores.
//!
//! Cada sesión vive detrás de su propio `tokio::sync::Mutex`: las interacciones
//! de una misma sesión se serializan (una subida o un turno de chat cada vez),
//! y el aislamiento entre sesiones se consigue sólo con el espacio de nombres
//! de las claves de caché.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{error::AppError, models::ChatTurn, rag::QueryEngine};

/// Identificador opaco de sesión, generado una vez por pestaña.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Clave estructurada de la caché: nunca se concatena en un string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub session: SessionId,
    pub filename: String,
}

/// Historial ordenado de turnos. Se vacía con "Limpiar".
#[derive(Debug, Default)]
pub struct Transcript {
    turns: Vec<ChatTurn>,
}

impl Transcript {
    pub fn push(&mut self, turn: ChatTurn) {
        self.turns.push(turn);
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Motores de consulta ya construidos. Sobrevive a los reinicios del chat.
#[derive(Default)]
pub struct EngineCache {
    engines: HashMap<EngineKey, Arc<QueryEngine>>,
}

impl EngineCache {
    pub fn get(&self, key: &EngineKey) -> Option<Arc<QueryEngine>> {
        self.engines.get(key).cloned()
    }

    pub fn insert(&mut self, key: EngineKey, engine: Arc<QueryEngine>) {
        self.engines.insert(key, engine);
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }
}

/// Contexto explícito de una sesión; se pasa a cada handler a través del store.
pub struct Session {
    pub id: SessionId,
    pub transcript: Transcript,
    pub cache: EngineCache,
    pub api_key: Option<String>,
    pub active_file: Option<String>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            transcript: Transcript::default(),
            cache: EngineCache::default(),
            api_key: None,
            active_file: None,
        }
    }

    pub fn key_for(&self, filename: &str) -> EngineKey {
        EngineKey {
            session: self.id,
            filename: filename.to_string(),
        }
    }

    /// Motor del último fichero subido; `None` mientras la sesión esté en `idle`.
    pub fn active_engine(&self) -> Option<Arc<QueryEngine>> {
        let filename = self.active_file.as_deref()?;
        self.cache.get(&self.key_for(filename))
    }

    /// Vacía el historial; la caché de índices se mantiene.
    pub fn reset_chat(&mut self) {
        self.transcript.clear();
    }
}

pub type SharedSession = Arc<tokio::sync::Mutex<Session>>;

struct Entry {
    session: SharedSession,
    last_seen: Instant,
}

/// Registro de sesiones vivas del proceso.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<SessionId, Entry>>>,
}

impl SessionStore {
    pub fn create(&self) -> SessionId {
        let id = SessionId::new();
        let session = Arc::new(tokio::sync::Mutex::new(Session::new(id)));
        self.lock().insert(
            id,
            Entry {
                session,
                last_seen: Instant::now(),
            },
        );
        info!("Sesión creada: {id}");
        id
    }

    /// Cada acceso cuenta como actividad de la sesión.
    pub fn get(&self, id: SessionId) -> Result<SharedSession, AppError> {
        let mut sessions = self.lock();
        let entry = sessions
            .get_mut(&id)
            .ok_or(AppError::SessionNotFound(id))?;
        entry.last_seen = Instant::now();
        Ok(entry.session.clone())
    }

    pub fn remove(&self, id: SessionId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            info!("Sesión eliminada: {id}");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Elimina las sesiones sin actividad durante `ttl`. Una sesión bloqueada
    /// (subida o respuesta en curso) nunca se elimina.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let keep = entry.last_seen.elapsed() < ttl || entry.session.try_lock().is_err();
            if !keep {
                info!("Sesión {id} eliminada por inactividad.");
            }
            keep
        });
        before - sessions.len()
    }

    /// Barrido periódico de sesiones inactivas (pestañas que no avisaron al cerrarse).
    pub fn spawn_idle_sweeper(&self, ttl: Duration) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval((ttl / 4).max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                let removed = store.sweep_idle(ttl);
                if removed > 0 {
                    debug!("Barrido de sesiones: {removed} eliminada(s), {} activa(s).", store.len());
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Entry>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_are_created_and_removed() {
        let store = SessionStore::default();
        let id = store.create();
        assert!(store.get(id).is_ok());
        assert_eq!(store.len(), 1);

        assert!(store.remove(id));
        assert!(matches!(store.get(id), Err(AppError::SessionNotFound(_))));
        assert!(!store.remove(id));
    }

    #[tokio::test]
    async fn engine_keys_are_namespaced_by_session() {
        let store = SessionStore::default();
        let a = store.get(store.create()).unwrap();
        let b = store.get(store.create()).unwrap();

        let key_a = a.lock().await.key_for("sales.csv");
        let key_b = b.lock().await.key_for("sales.csv");
        assert_ne!(key_a, key_b);
        assert_eq!(key_a.filename, key_b.filename);
    }

    #[tokio::test]
    async fn idle_sessions_are_swept_unless_busy() {
        let store = SessionStore::default();
        let idle = store.create();
        let busy = store.create();
        let shared = store.get(busy).unwrap();
        let _guard = shared.lock().await;

        assert_eq!(store.sweep_idle(Duration::from_secs(3600)), 0);
        assert_eq!(store.sweep_idle(Duration::ZERO), 1);
        assert!(matches!(store.get(idle), Err(AppError::SessionNotFound(_))));
        assert!(store.get(busy).is_ok());
    }

    #[test]
    fn reset_only_clears_the_transcript() {
        let mut session = Session::new(SessionId::new());
        session.transcript.push(ChatTurn::user("hola"));
        session.active_file = Some("sales.csv".into());
        session.reset_chat();
        assert!(session.transcript.is_empty());
        assert_eq!(session.active_file.as_deref(), Some("sales.csv"));
    }
}
