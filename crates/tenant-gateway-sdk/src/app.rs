//! The application entry-point contract

use crate::{Body, Environ, HandlerError, StartResponse};

/// A tenant application.
///
/// The gateway calls `call` once per request with the request environment and
/// the response-initiation callback. `start_response` must be invoked before
/// the returned body yields its first chunk.
///
/// Closures with the matching signature are applications:
///
/// ```ignore
/// let app = |environ: &Environ, start: &mut dyn StartResponse| {
///     start.start(200, vec![("Content-Type".into(), "text/plain".into())]);
///     Ok(Body::from_chunks(["hello ", &environ[keys::SCRIPT_NAME]].map(String::from)))
/// };
/// ```
pub trait App: Send + Sync {
    fn call(&self, environ: &Environ, start_response: &mut dyn StartResponse) -> Result<Body, HandlerError>;
}

impl<F> App for F
where
    F: Fn(&Environ, &mut dyn StartResponse) -> Result<Body, HandlerError> + Send + Sync,
{
    fn call(&self, environ: &Environ, start_response: &mut dyn StartResponse) -> Result<Body, HandlerError> {
        self(environ, start_response)
    }
}
