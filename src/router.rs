//! Label-to-handler dispatch (§4.G.1, §7 `MissingRoute`). The crawler
//! looks up a request's `label` in the router; if no handler matches and
//! no default is registered, the request terminal-fails with
//! `CrawlError::MissingRoute`, while other requests continue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::errors::CrawlError;
use crate::request::Request;
use crate::session::Session;

/// `session` is shared (not a plain owned copy) so that a handler's own
/// cookie-jar mutations — e.g. from following a redirect itself — are
/// visible to the dispatch loop once the handler returns, instead of being
/// dropped along with the handler's local copy.
pub struct HandlerContext {
    pub request: Request,
    pub session: Arc<Mutex<Session>>,
}

pub type HandlerResult = Pin<Box<dyn Future<Output = Result<(), CrawlError>> + Send>>;
pub type RequestHandler = Arc<dyn Fn(HandlerContext) -> HandlerResult + Send + Sync>;

#[derive(Clone)]
pub struct Router {
    routes: HashMap<String, RequestHandler>,
    default: Option<RequestHandler>,
}

impl Default for Router {
    fn default() -> Self {
        Router::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            routes: HashMap::new(),
            default: None,
        }
    }

    pub fn add_handler(&mut self, label: impl Into<String>, handler: RequestHandler) {
        self.routes.insert(label.into(), handler);
    }

    pub fn set_default_handler(&mut self, handler: RequestHandler) {
        self.default = Some(handler);
    }

    /// Resolves the handler for a request's `label`, falling back to the
    /// default handler. Returns `MissingRoute` when neither exists.
    pub fn resolve(&self, request: &Request) -> Result<RequestHandler, CrawlError> {
        if let Some(label) = &request.label {
            if let Some(handler) = self.routes.get(label) {
                return Ok(handler.clone());
            }
        }
        self.default
            .clone()
            .ok_or_else(|| CrawlError::MissingRoute(request.label.clone().unwrap_or_default()))
    }
}
