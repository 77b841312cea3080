use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::config::AppConfig;
use crate::engine::RagEngine;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engine: Arc<RagEngine>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Arc<RagEngine>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            config,
            engine,
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown))),
        }
    }
}
