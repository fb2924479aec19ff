//! Yes/no confirmation requests answered by whichever UI overlay is
//! currently registered.
//!
//! There is a single listener slot: registering a listener replaces the
//! previous one, and requests made while no listener is registered are
//! denied. Callers wanting several dialogs must await them one at a time.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub title: String,
    pub message: String,
    pub confirm_label: Option<String>,
    pub destructive: bool,
}

impl ConfirmRequest {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            confirm_label: None,
            destructive: false,
        }
    }

    pub fn confirm_label(mut self, label: impl Into<String>) -> Self {
        self.confirm_label = Some(label.into());
        self
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }
}

/// Handed to the listener; dropping it without answering denies the request.
pub struct Responder(oneshot::Sender<bool>);

impl Responder {
    pub fn respond(self, confirmed: bool) {
        let _ = self.0.send(confirmed);
    }
}

type Listener = Arc<dyn Fn(ConfirmRequest, Responder) + Send + Sync>;

#[derive(Clone, Default)]
pub struct ConfirmChannel {
    listener: Arc<Mutex<Option<Listener>>>,
}

impl ConfirmChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(ConfirmRequest, Responder) + Send + Sync + 'static,
    {
        let mut slot = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            tracing::debug!("replacing registered confirm listener");
        }
        *slot = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    pub fn has_listener(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    pub async fn request_confirm(&self, request: ConfirmRequest) -> bool {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let Some(listener) = listener else {
            tracing::debug!("no confirm listener registered, denying '{}'", request.title);
            return false;
        };

        let (tx, rx) = oneshot::channel();
        listener(request, Responder(tx));
        rx.await.unwrap_or(false)
    }
}
