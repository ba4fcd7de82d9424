use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// A component with a start/close lifecycle owned by an [`Instance`].
#[async_trait]
pub trait Feature: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn start(&self) -> Result<()>;

    /// Must be safe to call more than once and on a feature that never
    /// started.
    async fn close(&self) -> Result<()>;
}

/// Starts features in registration order and closes them in reverse.
#[derive(Default)]
pub struct Instance {
    features: Vec<Arc<dyn Feature>>,
    started: usize,
}

impl Instance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_feature(&mut self, feature: Arc<dyn Feature>) {
        self.features.push(feature);
    }

    pub fn features(&self) -> &[Arc<dyn Feature>] {
        &self.features
    }

    /// On failure the features already started are closed again and the
    /// error is returned.
    pub async fn start(&mut self) -> Result<()> {
        while self.started < self.features.len() {
            let feature = self.features[self.started].clone();
            if let Err(e) = feature.start().await {
                error!("Failed to start {}: {}", feature.name(), e);
                self.close().await;
                return Err(e);
            }
            info!("{} started", feature.name());
            self.started += 1;
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        while self.started > 0 {
            self.started -= 1;
            let feature = &self.features[self.started];
            match feature.close().await {
                Ok(()) => info!("{} stopped", feature.name()),
                Err(e) => error!("Failed to close {}: {}", feature.name(), e),
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.started > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        fail_start: bool,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Feature for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(Error::config(format!("{} cannot start", self.name)));
            }
            self.events.lock().push(format!("start {}", self.name));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.events.lock().push(format!("close {}", self.name));
            Ok(())
        }
    }

    fn recorder(name: &'static str, fail_start: bool, events: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Feature> {
        Arc::new(Recorder {
            name,
            fail_start,
            events: events.clone(),
        })
    }

    #[tokio::test]
    async fn test_close_in_reverse_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut instance = Instance::new();
        instance.add_feature(recorder("server", false, &events));
        instance.add_feature(recorder("tun", false, &events));

        instance.start().await.unwrap();
        assert!(instance.is_running());
        instance.close().await;
        instance.close().await;

        assert_eq!(
            *events.lock(),
            vec!["start server", "start tun", "close tun", "close server"]
        );
    }

    #[tokio::test]
    async fn test_failed_start_closes_started_features() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut instance = Instance::new();
        instance.add_feature(recorder("server", false, &events));
        instance.add_feature(recorder("tun", true, &events));

        let err = instance.start().await.unwrap_err();
        assert_eq!(err.code(), "CONFIG");
        assert!(!instance.is_running());
        assert_eq!(*events.lock(), vec!["start server", "close server"]);
    }
}
