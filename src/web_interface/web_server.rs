use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::info;

use super::routes::api;
use crate::context::AppContext;
use crate::error_handling::types::WebError;

/// Web server for the HTTP and websocket API
pub struct WebServer {
    context: Arc<AppContext>,
}

impl WebServer {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Serves until `shutdown` resolves, then drains in-flight requests.
    pub async fn run(
        &self,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), WebError> {
        let (bound, server) = warp::serve(api(self.context.clone()))
            .try_bind_with_graceful_shutdown(addr, shutdown)
            .map_err(|e| WebError::BindFailed(format!("{}: {}", addr, e)))?;
        info!("Listening on http://{}", bound);
        server.await;
        info!("Web server stopped");
        Ok(())
    }
}
