//! Handler table consulted by the server pipeline.
//!
//! Handlers are typed closures. Registration erases the types: each method
//! becomes a function that decodes its arguments with the connection's codec
//! and returns a ready-to-run [`Invocation`] producing the encoded reply.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use muxrpc_frame::{Codec, CodecError};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RpcError};

/// A decoded request bound to its handler. Yields the encoded reply or the
/// error string to put in the response header.
pub type Invocation = Box<dyn FnOnce() -> std::result::Result<Vec<u8>, String> + Send>;

/// Outcome of decoding one request's arguments.
pub type Prepared = std::result::Result<Invocation, CodecError>;

type PrepareFn = dyn Fn(Codec, &[u8]) -> Prepared + Send + Sync;

/// One resolved method.
#[derive(Clone)]
pub struct MethodHandler {
    prepare: Arc<PrepareFn>,
}

impl MethodHandler {
    /// Decode arguments and bind them to the handler.
    ///
    /// A decode failure means the stream can no longer be trusted; the server
    /// closes the connection.
    pub fn prepare(&self, codec: Codec, body: &[u8]) -> Prepared {
        (self.prepare)(codec, body)
    }
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MethodHandler")
    }
}

/// A named group of methods, addressed as `Service.Method`.
pub struct Service {
    name: String,
    methods: HashMap<String, MethodHandler>,
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: HashMap::new(),
        }
    }

    /// Add a method. A later registration under the same name replaces the earlier one.
    ///
    /// ```
    /// use muxrpc_peer::Service;
    ///
    /// let arith = Service::new("Arith").method("Sum", |(a, b): (i64, i64)| {
    ///     Ok::<_, String>(a + b)
    /// });
    /// assert!(arith.has_method("Sum"));
    /// ```
    pub fn method<A, R, E, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        E: fmt::Display + 'static,
        F: Fn(A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let prepare = move |codec: Codec, body: &[u8]| -> Prepared {
            let args: A = codec.decode(body)?;
            let handler = Arc::clone(&handler);
            let invocation: Invocation = Box::new(move || {
                let reply = handler(args).map_err(|err| err.to_string())?;
                codec
                    .encode(&reply)
                    .map_err(|err| format!("rpc server: encode reply: {err}"))
            });
            Ok(invocation)
        };
        self.methods.insert(
            name.into(),
            MethodHandler {
                prepare: Arc::new(prepare),
            },
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish()
    }
}

/// All services a server exposes.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service. Names must be unique.
    pub fn register(&mut self, service: Service) -> Result<()> {
        if self.services.contains_key(service.name()) {
            return Err(RpcError::DuplicateService(service.name));
        }
        self.services.insert(service.name.clone(), service);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_service(mut self, service: Service) -> Result<Self> {
        self.register(service)?;
        Ok(self)
    }

    /// Look up `Service.Method`. The split happens at the last dot.
    pub fn resolve(&self, service_method: &str) -> Result<MethodHandler> {
        let (service, method) = service_method
            .rsplit_once('.')
            .filter(|(service, method)| !service.is_empty() && !method.is_empty())
            .ok_or_else(|| RpcError::IllFormedMethod(service_method.to_string()))?;

        let service = self
            .services
            .get(service)
            .ok_or_else(|| RpcError::ServiceNotFound(service.to_string()))?;
        service
            .methods
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(service_method.to_string()))
    }

    /// `Service.Method` names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .services
            .values()
            .flat_map(|service| {
                service
                    .method_names()
                    .into_iter()
                    .map(move |method| format!("{}.{}", service.name, method))
            })
            .collect();
        out.sort();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    fn registry() -> ServiceRegistry {
        let arith = Service::new("Arith")
            .method("Sum", |args: Args| Ok::<_, String>(args.a + args.b))
            .method("Div", |args: Args| {
                if args.b == 0 {
                    Err("divide by zero".to_string())
                } else {
                    Ok(args.a / args.b)
                }
            });
        ServiceRegistry::new()
            .with_service(arith)
            .expect("registration should succeed")
    }

    #[test]
    fn resolve_and_invoke() {
        let registry = registry();
        let codec = Codec::Bincode;
        let body = codec.encode(&Args { a: 2, b: 3 }).expect("encode");

        let handler = registry.resolve("Arith.Sum").expect("resolve");
        let invocation = handler.prepare(codec, &body).expect("args should decode");
        let reply = invocation().expect("handler should succeed");
        assert_eq!(codec.decode::<i64>(&reply).expect("reply should decode"), 5);
    }

    #[test]
    fn handler_error_becomes_string() {
        let registry = registry();
        let codec = Codec::Json;
        let body = codec.encode(&Args { a: 1, b: 0 }).expect("encode");

        let invocation = registry
            .resolve("Arith.Div")
            .expect("method should resolve")
            .prepare(codec, &body)
            .expect("args should decode");
        assert_eq!(invocation().expect_err("should fail"), "divide by zero");
    }

    #[test]
    fn lookup_failures_are_distinguished() {
        let registry = registry();
        assert!(matches!(
            registry.resolve("ArithSum"),
            Err(RpcError::IllFormedMethod(_))
        ));
        assert!(matches!(
            registry.resolve("Arith."),
            Err(RpcError::IllFormedMethod(_))
        ));
        assert!(matches!(
            registry.resolve("Geo.Sum"),
            Err(RpcError::ServiceNotFound(name)) if name == "Geo"
        ));
        assert!(matches!(
            registry.resolve("Arith.Mul"),
            Err(RpcError::MethodNotFound(_))
        ));
    }

    #[test]
    fn bad_arguments_fail_to_prepare() {
        let registry = registry();
        let handler = registry.resolve("Arith.Sum").expect("resolve");
        assert!(handler.prepare(Codec::Json, b"{not json").is_err());
    }

    #[test]
    fn duplicate_service_rejected() {
        let mut registry = registry();
        let err = registry
            .register(Service::new("Arith"))
            .expect_err("duplicate should fail");
        assert!(matches!(err, RpcError::DuplicateService(name) if name == "Arith"));
        assert_eq!(registry.list(), vec!["Arith.Div", "Arith.Sum"]);
    }
}
