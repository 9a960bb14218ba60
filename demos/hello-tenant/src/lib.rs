//! Hello tenant
//!
//! Build with `cargo build --release` and copy `target/release/libapp.so` to
//! `<base>/<host>/wsgi/`. If a `greeting` module is deployed next to it (or in
//! the tenant's private dependency directory) its `text` value is used.

use tenant_gateway_sdk::prelude::*;

struct Hello {
    greeting: String,
}

impl App for Hello {
    fn call(&self, environ: &Environ, start_response: &mut dyn StartResponse) -> Result<Body, HandlerError> {
        start_response.start(200, vec![("Content-Type".into(), "application/json".into())]);

        Body::json(&json!({
            "message": self.greeting,
            "host": environ.get(keys::HTTP_HOST),
            "path": environ.get(keys::PATH_INFO),
            "request_id": environ.get(keys::REQUEST_ID),
        }))
    }
}

fn init(importer: &mut dyn Importer) -> Result<Exports, ImportError> {
    let greeting = importer
        .import("greeting")
        .ok()
        .and_then(|module| module.value("text").map(str::to_string))
        .unwrap_or_else(|| "Hello, World!".to_string());

    Ok(Exports::new()
        .with_value("greeting", greeting.clone())
        .with_app("app", Hello { greeting }))
}

export_module!(init);
