// Dependency-ordered service bring-up and tear-down.
//
// Services declare dependencies by name; the kernel topologically orders
// them and drives configure -> pre_initialize -> initialize ->
// post_initialize on the way up and terminate in reverse order on the way
// down. Cycles and unknown dependencies are configuration errors.

use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle contract implemented by every managed service.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Names of services that must come up before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn configure(&self) -> Result<()> {
        Ok(())
    }

    async fn pre_initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn initialize(&self) -> Result<()>;

    async fn post_initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self) -> Result<()>;
}

/// Orders and drives registered services.
pub struct ServiceKernel {
    services: Vec<Arc<dyn Service>>,
}

impl ServiceKernel {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
        }
    }

    pub fn register(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    /// Kahn's algorithm over the dependency graph.
    fn resolve_order(&self) -> Result<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .services
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name(), i))
            .collect();

        let mut in_degree = vec![0usize; self.services.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.services.len()];

        for (i, service) in self.services.iter().enumerate() {
            for dep in service.dependencies() {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(ClusterError::Configuration(format!(
                        "service {} depends on unknown service {}",
                        service.name(),
                        dep
                    )));
                };
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: Vec<usize> = (0..self.services.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.services.len());

        while let Some(i) = ready.pop() {
            order.push(i);
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(j);
                }
            }
        }

        if order.len() != self.services.len() {
            let stuck: Vec<&str> = (0..self.services.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.services[i].name())
                .collect();
            return Err(ClusterError::Configuration(format!(
                "service dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }

        Ok(order)
    }

    /// Brings every service up. On failure, already-initialized services are
    /// terminated in reverse order before the error propagates.
    pub async fn start_all(&self) -> Result<()> {
        let order = self.resolve_order()?;

        for &i in &order {
            self.services[i].configure().await?;
        }
        for &i in &order {
            self.services[i].pre_initialize().await?;
        }

        let mut started: Vec<usize> = Vec::new();
        for &i in &order {
            let service = &self.services[i];
            tracing::debug!(service = service.name(), "initializing");
            if let Err(e) = service.initialize().await {
                tracing::error!(service = service.name(), error = %e, "initialization failed");
                for &j in started.iter().rev() {
                    if let Err(term) = self.services[j].terminate().await {
                        tracing::warn!(service = self.services[j].name(), error = %term,
                            "terminate during rollback failed");
                    }
                }
                return Err(e);
            }
            started.push(i);
        }

        for &i in &order {
            self.services[i].post_initialize().await?;
        }

        Ok(())
    }

    /// Terminates every service in reverse initialization order. Individual
    /// failures are logged and do not stop the remaining services.
    pub async fn stop_all(&self) -> Result<()> {
        let order = self.resolve_order()?;
        for &i in order.iter().rev() {
            let service = &self.services[i];
            tracing::debug!(service = service.name(), "terminating");
            if let Err(e) = service.terminate().await {
                tracing::warn!(service = service.name(), error = %e, "terminate failed");
            }
        }
        Ok(())
    }
}

impl Default for ServiceKernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    struct TestService {
        name: String,
        deps: Vec<String>,
        recorder: Arc<Recorder>,
        fail_init: bool,
    }

    #[async_trait]
    impl Service for TestService {
        fn name(&self) -> &str {
            &self.name
        }

        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }

        async fn initialize(&self) -> Result<()> {
            if self.fail_init {
                return Err(ClusterError::Internal("boom".into()));
            }
            self.recorder.log.lock().push(format!("init:{}", self.name));
            Ok(())
        }

        async fn terminate(&self) -> Result<()> {
            self.recorder.log.lock().push(format!("term:{}", self.name));
            Ok(())
        }
    }

    fn service(
        recorder: &Arc<Recorder>,
        name: &str,
        deps: &[&str],
        fail_init: bool,
    ) -> Arc<dyn Service> {
        Arc::new(TestService {
            name: name.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            recorder: recorder.clone(),
            fail_init,
        })
    }

    #[tokio::test]
    async fn test_dependency_order() {
        let recorder = Arc::new(Recorder {
            log: Mutex::new(Vec::new()),
        });
        let mut kernel = ServiceKernel::new();
        kernel.register(service(&recorder, "messaging", &["cluster"], false));
        kernel.register(service(&recorder, "network", &[], false));
        kernel.register(service(&recorder, "cluster", &["network"], false));

        kernel.start_all().await.unwrap();

        let log = recorder.log.lock().clone();
        let pos = |name: &str| log.iter().position(|e| e == name).unwrap();
        assert!(pos("init:network") < pos("init:cluster"));
        assert!(pos("init:cluster") < pos("init:messaging"));
    }

    #[tokio::test]
    async fn test_reverse_order_shutdown() {
        let recorder = Arc::new(Recorder {
            log: Mutex::new(Vec::new()),
        });
        let mut kernel = ServiceKernel::new();
        kernel.register(service(&recorder, "network", &[], false));
        kernel.register(service(&recorder, "cluster", &["network"], false));

        kernel.start_all().await.unwrap();
        kernel.stop_all().await.unwrap();

        let log = recorder.log.lock().clone();
        let pos = |name: &str| log.iter().position(|e| e == name).unwrap();
        assert!(pos("term:cluster") < pos("term:network"));
    }

    #[tokio::test]
    async fn test_cycle_detected() {
        let recorder = Arc::new(Recorder {
            log: Mutex::new(Vec::new()),
        });
        let mut kernel = ServiceKernel::new();
        kernel.register(service(&recorder, "a", &["b"], false));
        kernel.register(service(&recorder, "b", &["a"], false));

        let err = kernel.start_all().await.unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn test_unknown_dependency() {
        let recorder = Arc::new(Recorder {
            log: Mutex::new(Vec::new()),
        });
        let mut kernel = ServiceKernel::new();
        kernel.register(service(&recorder, "a", &["missing"], false));

        let err = kernel.start_all().await.unwrap_err();
        assert!(err.to_string().contains("unknown service"));
    }

    #[tokio::test]
    async fn test_rollback_on_failure() {
        let recorder = Arc::new(Recorder {
            log: Mutex::new(Vec::new()),
        });
        let mut kernel = ServiceKernel::new();
        kernel.register(service(&recorder, "ok", &[], false));
        kernel.register(service(&recorder, "bad", &["ok"], true));

        assert!(kernel.start_all().await.is_err());

        let log = recorder.log.lock().clone();
        assert!(log.contains(&"init:ok".to_string()));
        assert!(log.contains(&"term:ok".to_string()));
    }
}
