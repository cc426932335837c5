use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Init,
    Starting,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    fn name(&self) -> &str;

    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

type ServiceFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ServiceFactory = Box<dyn FnOnce(CancellationToken) -> ServiceFuture + Send>;

/// A background loop owned by the lifecycle: spawned on start, cancelled and
/// joined on shutdown.
pub struct Service {
    name: String,
    cancel: CancellationToken,
    factory: Option<ServiceFactory>,
    handle: Option<JoinHandle<()>>,
}

impl Service {
    pub fn new<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            cancel: CancellationToken::new(),
            factory: Some(Box::new(move |cancel| -> ServiceFuture {
                Box::pin(factory(cancel))
            })),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for Service {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&mut self) -> Result<()> {
        if let Some(factory) = self.factory.take() {
            self.handle = Some(tokio::spawn(factory(self.cancel.clone())));
        }
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<Mutex<dyn LifecycleComponent + Send>>>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attach(&mut self, component: Arc<Mutex<dyn LifecycleComponent + Send>>) {
        self.components.push(component);
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Starting");
        self.state = LifecycleState::Starting;
        for comp in &self.components {
            let mut comp = comp.lock().await;
            comp.on_start().await?;
            info!("Started {}", comp.name());
        }

        info!("Lifecycle Phase: Ready");
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Shut components down in reverse attach order.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in self.components.iter().rev() {
            let mut comp = comp.lock().await;
            if let Err(e) = comp.on_shutdown().await {
                warn!("Component {} shutdown error: {}", comp.name(), e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn services_run_until_shutdown() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let service = Arc::new(Mutex::new(Service::new("ticker", move |cancel| async move {
            cancel.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        })));

        let mut manager = LifecycleManager::new();
        manager.attach(service.clone());
        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Ready);
        assert!(service.lock().await.is_running());
        assert!(!finished.load(Ordering::SeqCst));

        manager.shutdown().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Shutdown);
        assert!(finished.load(Ordering::SeqCst));
        assert!(!service.lock().await.is_running());
    }
}
