use std::future::Future;
use std::sync::Arc;

use log::{error, info};

use crate::configuration::Config;
use crate::context::AppContext;
use crate::error_handling::types::ControllerError;
use crate::web_interface::WebServer;

/// Owns the application context for the lifetime of the process.
pub struct Controller {
    pub config: Config,
    context: Option<Arc<AppContext>>,
}

impl Controller {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            context: None,
        }
    }

    /// Uses an already built context instead of building one on `run`.
    pub fn with_context(config: Config, context: Arc<AppContext>) -> Self {
        Self {
            config,
            context: Some(context),
        }
    }

    /// Serves until ctrl-c.
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("[!] Cannot listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await
    }

    pub async fn run_until(
        &mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), ControllerError> {
        let addr = self
            .config
            .socket_addr()
            .map_err(ControllerError::ConfigurationError)?;
        let context = match &self.context {
            Some(context) => context.clone(),
            None => {
                info!("Building application context");
                let context = Arc::new(AppContext::build(self.config.clone()).await?);
                self.context = Some(context.clone());
                context
            }
        };

        let served = WebServer::new(context)
            .run(addr, shutdown)
            .await
            .map_err(ControllerError::WebError);
        self.shutdown().await;
        served
    }

    /// Closes every terminal tab. Runs also when the server failed.
    pub async fn shutdown(&self) {
        if let Some(context) = &self.context {
            context.terminals.shutdown_all().await;
        }
        info!("Controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::test_context;
    use crate::session_management::TabSpec;

    #[tokio::test]
    async fn test_run_until_closes_tabs() {
        let (_dir, ctx) = test_context().await;
        let config = Config {
            port: 0,
            ..ctx.config.clone()
        };
        let ctx = Arc::new(ctx);
        let _tab = ctx
            .terminals
            .open_tab("10.0.0.5", TabSpec::default())
            .await
            .unwrap();
        assert_eq!(ctx.terminals.list_tabs().len(), 1);

        let mut controller = Controller::with_context(config, ctx.clone());
        controller.run_until(async {}).await.unwrap();
        assert!(ctx.terminals.list_tabs().is_empty());
    }

    #[tokio::test]
    async fn test_bad_bind_address_is_a_config_error() {
        let mut controller = Controller::new(Config {
            bind_address: "not-an-ip".into(),
            ..Config::default()
        });
        let result = controller.run_until(async {}).await;
        assert!(matches!(result, Err(ControllerError::ConfigurationError(_))));
    }
}
