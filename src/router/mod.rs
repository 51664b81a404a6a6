//! Request routing: map URL patterns and HTTP methods to handler functions.
//!
//! [`Router`] keeps one segment trie per HTTP method plus one trie for routes
//! registered with [`Router::handle`], which answer any method. Patterns are
//! built from two kinds of segment:
//!
//! | Pattern                   | Example match          | Captured params         |
//! |---------------------------|------------------------|-------------------------|
//! | `/users`                  | `/users`               | *(none)*                |
//! | `/users/{id}`             | `/users/42`            | `id → "42"`             |
//! | `/users/{id}/posts/{pid}` | `/users/7/posts/99`    | `id → "7"`, `pid → "99"`|
//!
//! At every node an exact segment is tried before the wildcard child, and a
//! branch that dead-ends further down is abandoned in favour of the next
//! candidate, so `/users/me` and `/users/{id}` can coexist. Bindings made on a
//! dead branch are undone. A wildcard never matches an empty segment.
//!
//! Paths are matched as given: `/users/` and `/users` are different routes.
//! Put [`TrailingSlashMiddleware`](crate::middleware::TrailingSlashMiddleware)
//! in front of the router to fold them together.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::{Context, PathParams};
use crate::middleware::{BoxResponseFuture, MiddlewareHandler, Next};
use crate::realtime::Upgrader;
use crate::{Method, Request, Response, StatusCode};

/// Type-erased, heap-allocated async handler that processes a [`Context`] and returns a
/// [`Response`].
///
/// Handlers are stored behind `Arc<dyn Fn(…)>` so they can be cloned and shared across
/// threads without copying the underlying closure. In practice you never construct this
/// type directly; use [`Router::get`], [`Router::post`], and the other method-specific
/// helpers instead.
pub type Handler =
    Arc<dyn Fn(Context) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket impl
/// below. Router methods accept `impl IntoHandler` so the two-type-parameter where-bound
/// does not need to be repeated at every call site.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(ctx))
    }
}

fn into_handler(handler: impl IntoHandler) -> Handler {
    Arc::new(move |ctx| handler.call(ctx))
}

/// A resolved route: the handler plus the middleware registered with it
/// (group middleware, outermost first).
#[derive(Clone)]
pub struct Endpoint {
    handler: Handler,
    middleware: Arc<[MiddlewareHandler]>,
}

impl Endpoint {
    /// Runs the route middleware and then the handler.
    pub fn call(&self, ctx: Context) -> BoxResponseFuture {
        Next::new(Arc::clone(&self.middleware), Arc::clone(&self.handler)).run(ctx)
    }
}

#[derive(Clone, Default)]
struct Node {
    children: HashMap<String, Node>,
    wildcard: Option<Box<Wildcard>>,
    endpoint: Option<Endpoint>,
}

#[derive(Clone)]
struct Wildcard {
    name: String,
    node: Node,
}

fn segments(path: &str) -> Vec<&str> {
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    }
}

fn wildcard_name(segment: &str) -> Option<&str> {
    segment.strip_prefix('{')?.strip_suffix('}')
}

impl Node {
    // Returns `false` when an existing endpoint was replaced.
    fn insert(&mut self, pattern: &str, segments: &[&str], endpoint: Endpoint) -> bool {
        let Some((first, rest)) = segments.split_first() else {
            if self.endpoint.replace(endpoint).is_some() {
                tracing::debug!(pattern, "route re-registered; previous handler replaced");
                return false;
            }
            return true;
        };

        let child = match wildcard_name(first) {
            Some(name) => {
                let wildcard = self.wildcard.get_or_insert_with(|| {
                    Box::new(Wildcard {
                        name: name.to_owned(),
                        node: Node::default(),
                    })
                });
                if wildcard.name != name {
                    panic!(
                        "route `{pattern}`: wildcard `{{{name}}}` conflicts with existing `{{{}}}`",
                        wildcard.name
                    );
                }
                &mut wildcard.node
            }
            None => self.children.entry((*first).to_owned()).or_default(),
        };
        child.insert(pattern, rest, endpoint)
    }

    fn lookup(&self, segments: &[&str], params: &mut PathParams) -> Option<&Endpoint> {
        let Some((first, rest)) = segments.split_first() else {
            return self.endpoint.as_ref();
        };

        if let Some(found) = self
            .children
            .get(*first)
            .and_then(|child| child.lookup(rest, params))
        {
            return Some(found);
        }

        if let Some(wildcard) = &self.wildcard {
            if first.is_empty() {
                return None;
            }
            params.insert(wildcard.name.as_str(), *first);
            if let Some(found) = wildcard.node.lookup(rest, params) {
                return Some(found);
            }
            params.pop();
        }

        None
    }
}

/// HTTP request router that dispatches requests to registered handler functions.
///
/// A `Router` is built mutably and then shared immutably (the engine keeps it
/// behind an atomic snapshot pointer). It is `Clone`, so a live table can be
/// copied, extended and swapped in.
///
/// # Examples
///
/// ```rust,no_run
/// use evserve::{Router, Response, StatusCode, context::Context};
///
/// let mut router = Router::new();
///
/// router.get("/ping", |_ctx| async { Response::new(StatusCode::Ok) });
///
/// router.get("/users/{id}", |ctx: Context| async move {
///     let id = ctx.params().get("id").unwrap_or("unknown").to_owned();
///     Response::new(StatusCode::Ok).body(id)
/// });
///
/// router.group("/admin", |admin| {
///     admin.get("/stats", |_ctx| async { Response::text("ok") });
/// });
/// ```
#[derive(Clone)]
pub struct Router {
    trees: HashMap<Method, Node>,
    any: Node,
    middleware: Arc<[MiddlewareHandler]>,
    not_found_body: Arc<str>,
    method_not_allowed: bool,
    routes: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use evserve::Router;
    ///
    /// let router = Router::new();
    /// assert!(router.is_empty());
    /// ```
    pub fn new() -> Self {
        Self {
            trees: HashMap::new(),
            any: Node::default(),
            middleware: Arc::from(Vec::new()),
            not_found_body: Arc::from("404 Not Found"),
            method_not_allowed: false,
            routes: 0,
        }
    }

    /// Register `handler` for `method` requests matching `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if a `{name}` segment conflicts with a wildcard of a different
    /// name already registered at the same position.
    pub fn add(&mut self, method: Method, pattern: &str, handler: impl IntoHandler) {
        self.insert(Some(method), pattern, into_handler(handler), Vec::new());
    }

    /// Like [`add`](Self::add), with middleware that runs only for this route.
    pub fn add_with(
        &mut self,
        method: Method,
        pattern: &str,
        middleware: Vec<MiddlewareHandler>,
        handler: impl IntoHandler,
    ) {
        self.insert(Some(method), pattern, into_handler(handler), middleware);
    }

    /// Register a handler for `GET` requests matching `path`.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use evserve::{Router, Response, StatusCode};
    ///
    /// let mut router = Router::new();
    /// router.get("/hello", |_ctx| async { Response::new(StatusCode::Ok) });
    /// ```
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Get, path, handler);
    }

    /// Register a handler for `POST` requests matching `path`.
    pub fn post(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Post, path, handler);
    }

    /// Register a handler for `PUT` requests matching `path`.
    pub fn put(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Put, path, handler);
    }

    /// Register a handler for `DELETE` requests matching `path`.
    pub fn delete(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Delete, path, handler);
    }

    /// Register a handler for `PATCH` requests matching `path`.
    pub fn patch(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Patch, path, handler);
    }

    /// Register a handler for `OPTIONS` requests matching `path`.
    pub fn options(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Options, path, handler);
    }

    /// Register a handler for `HEAD` requests matching `path`.
    ///
    /// Without one, `HEAD` falls back to the `GET` route and the engine drops
    /// the body when writing.
    pub fn head(&mut self, path: &str, handler: impl IntoHandler) {
        self.add(Method::Head, path, handler);
    }

    /// Register a handler for every method. Method-specific routes take
    /// precedence.
    pub fn handle(&mut self, path: &str, handler: impl IntoHandler) {
        self.insert(None, path, into_handler(handler), Vec::new());
    }

    /// Register a WebSocket endpoint: `GET path` runs the handshake with
    /// `upgrader` and, on success, hands the connection over to it.
    pub fn websocket(&mut self, path: &str, upgrader: Upgrader) {
        self.get(path, websocket_handler(upgrader));
    }

    /// Register routes under a common `prefix`, optionally with middleware
    /// shared by all of them.
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use evserve::{Router, Response};
    /// use evserve::middleware::{LoggerMiddleware, from_middleware};
    ///
    /// let mut router = Router::new();
    /// router.group("/api", |api| {
    ///     api.use_middleware(from_middleware(Arc::new(LoggerMiddleware)));
    ///     api.get("/users/{id}", |_ctx| async { Response::text("user") });
    ///     api.group("/v2", |v2| {
    ///         v2.get("/users", |_ctx| async { Response::text("users") });
    ///     });
    /// });
    /// ```
    pub fn group(&mut self, prefix: &str, build: impl FnOnce(&mut Group<'_>)) {
        let mut group = Group {
            router: self,
            prefix: join(prefix, ""),
            middleware: Vec::new(),
        };
        build(&mut group);
    }

    /// Append a global middleware. Global middleware wrap routing itself, so
    /// they see every request (including ones that end in `404`) and may
    /// rewrite the request before it is matched.
    pub fn use_middleware(&mut self, middleware: MiddlewareHandler) {
        let mut all = self.middleware.to_vec();
        all.push(middleware);
        self.middleware = all.into();
    }

    /// Body of the `404` response sent when nothing matches.
    pub fn not_found_body(&mut self, body: impl Into<String>) {
        self.not_found_body = Arc::from(body.into());
    }

    /// When enabled, a path that matches under some other method is answered
    /// with `405 Method Not Allowed` and an `Allow` header instead of `404`.
    pub fn method_not_allowed(&mut self, enabled: bool) {
        self.method_not_allowed = enabled;
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes == 0
    }

    fn insert(
        &mut self,
        method: Option<Method>,
        pattern: &str,
        handler: Handler,
        middleware: Vec<MiddlewareHandler>,
    ) {
        let endpoint = Endpoint {
            handler,
            middleware: middleware.into(),
        };
        let tree = match method {
            Some(method) => self.trees.entry(method).or_default(),
            None => &mut self.any,
        };
        if tree.insert(pattern, &segments(pattern), endpoint) {
            self.routes += 1;
        }
    }

    /// Resolve `request` to an endpoint, binding path parameters on it.
    ///
    /// The method's own trie is searched first (`HEAD` also tries `GET`), then
    /// the any-method trie. On `None` the request carries no bindings.
    pub fn route(&self, request: &mut Request) -> Option<Endpoint> {
        let method = request.method().clone();
        let path = request.path().to_owned();
        let segments = segments(&path);
        let params = request.params_mut();
        params.clear();

        let mut candidates = Vec::with_capacity(3);
        candidates.extend(self.trees.get(&method));
        if method == Method::Head {
            candidates.extend(self.trees.get(&Method::Get));
        }
        candidates.push(&self.any);

        candidates
            .into_iter()
            .find_map(|tree| tree.lookup(&segments, params))
            .cloned()
    }

    /// Run `ctx` through the global middleware, routing and the matched
    /// endpoint.
    pub fn dispatch(self: Arc<Self>, ctx: Context) -> BoxResponseFuture {
        let middleware = Arc::clone(&self.middleware);
        let router = self;
        let tail: Handler = Arc::new(move |ctx| {
            let router = Arc::clone(&router);
            Box::pin(async move { router.resolve(ctx).await })
        });
        Next::new(middleware, tail).run(ctx)
    }

    async fn resolve(&self, mut ctx: Context) -> Response {
        match self.route(ctx.request_mut()) {
            Some(endpoint) => endpoint.call(ctx).await,
            None => self.unmatched(ctx.request()),
        }
    }

    fn unmatched(&self, request: &Request) -> Response {
        if self.method_not_allowed {
            let allowed = self.allowed_methods(request.path());
            if !allowed.is_empty() {
                let allowed: Vec<&str> = allowed.iter().map(Method::as_str).collect();
                return Response::method_not_allowed(&allowed);
            }
        }
        Response::new(StatusCode::NotFound)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(self.not_found_body.as_ref())
    }

    // Methods with a route for `path`, in a stable order.
    fn allowed_methods(&self, path: &str) -> Vec<Method> {
        let segments = segments(path);
        let mut scratch = PathParams::new();
        let mut matches = |tree: &Node| {
            scratch.clear();
            tree.lookup(&segments, &mut scratch).is_some()
        };

        let mut allowed: Vec<Method> = Method::ROUTABLE
            .into_iter()
            .filter(|m| self.trees.get(m).is_some_and(&mut matches))
            .collect();
        let mut custom: Vec<Method> = self
            .trees
            .iter()
            .filter(|(m, _)| !Method::ROUTABLE.contains(*m))
            .filter(|(_, tree)| matches(*tree))
            .map(|(m, _)| m.clone())
            .collect();
        custom.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        allowed.extend(custom);
        allowed
    }
}

fn websocket_handler(upgrader: Upgrader) -> impl IntoHandler {
    move |ctx: Context| {
        let upgrader = upgrader.clone();
        async move { upgrader.respond(ctx.request()) }
    }
}

fn join(prefix: &str, pattern: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let pattern = pattern.trim_start_matches('/');
    match (prefix.is_empty(), pattern.is_empty()) {
        (true, true) => "/".to_owned(),
        (_, true) => prefix.to_owned(),
        (true, false) => format!("/{pattern}"),
        (false, false) => format!("{prefix}/{pattern}"),
    }
}

/// Routes registered under a shared prefix and middleware; see
/// [`Router::group`].
pub struct Group<'r> {
    router: &'r mut Router,
    prefix: String,
    middleware: Vec<MiddlewareHandler>,
}

impl Group<'_> {
    /// Middleware for every route registered on this group after the call,
    /// including routes of nested groups.
    pub fn use_middleware(&mut self, middleware: MiddlewareHandler) -> &mut Self {
        self.middleware.push(middleware);
        self
    }

    pub fn add(&mut self, method: Method, pattern: &str, handler: impl IntoHandler) {
        let path = join(&self.prefix, pattern);
        self.router
            .insert(Some(method), &path, into_handler(handler), self.middleware.clone());
    }

    pub fn get(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.add(Method::Get, pattern, handler);
    }

    pub fn post(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.add(Method::Post, pattern, handler);
    }

    pub fn put(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.add(Method::Put, pattern, handler);
    }

    pub fn delete(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.add(Method::Delete, pattern, handler);
    }

    pub fn patch(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.add(Method::Patch, pattern, handler);
    }

    pub fn options(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.add(Method::Options, pattern, handler);
    }

    pub fn head(&mut self, pattern: &str, handler: impl IntoHandler) {
        self.add(Method::Head, pattern, handler);
    }

    pub fn handle(&mut self, pattern: &str, handler: impl IntoHandler) {
        let path = join(&self.prefix, pattern);
        self.router
            .insert(None, &path, into_handler(handler), self.middleware.clone());
    }

    pub fn websocket(&mut self, pattern: &str, upgrader: Upgrader) {
        self.get(pattern, websocket_handler(upgrader));
    }

    pub fn group(&mut self, prefix: &str, build: impl FnOnce(&mut Group<'_>)) {
        let mut nested = Group {
            prefix: join(&self.prefix, prefix),
            middleware: self.middleware.clone(),
            router: &mut *self.router,
        };
        build(&mut nested);
    }
}
