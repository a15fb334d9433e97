//! MITM dispatch pipeline.
//!
//! Per intercepted request: apply the fixed header-fix exception list, run
//! the first matching request rewrite, consult the smart cache, and emit a
//! request-sent event. Per response: run the first matching response
//! rewrite, force no-cache headers on rewritten traffic, store cacheable
//! bodies, and emit a response-received event. Rule and cache failures are
//! logged and swallowed; the original traffic always continues.

use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hudsucker::{
    hyper::{Request, Response},
    Body, HttpContext, HttpHandler, RequestOrResponse,
};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_LENGTH,
    PRAGMA, TRANSFER_ENCODING,
};
use hyper::{Method, StatusCode};

use wayfarer_core::{EventBus, ProxyEvent, TrafficDisplay};

use crate::cache::{self, CacheEntry, SmartCache};
use crate::context::ProxyContext;
use crate::domains::{is_intercepted_host, strip_port, Domain};
use crate::routes::RouteTable;

/// Marker header carrying the proxy version on every intercepted response.
pub const VERSION_HEADER: &str = "x-wayfarer-version";

/// Cache status header: `MISS` on store, `HIT` on a cache-served response.
pub const CACHE_STATUS_HEADER: &str = "x-wayfarer-cache";

/// `Cache-Control` forced onto rewritten outgoing requests.
const REQUEST_NO_CACHE: &str = "no-store, no-cache, must-revalidate";

/// `Cache-Control` forced onto rewritten responses.
const RESPONSE_NO_CACHE: &str = "no-store, no-cache, must-revalidate, max-age=0";

/// A narrowly-scoped header fix for one known endpoint.
///
/// This is a fixed exception list, not a general policy hook.
struct HeaderFix {
    domain: Domain,
    path_prefix: &'static str,
    header: &'static str,
}

/// The GameCms flight endpoint rejects stale clearance tokens replayed by
/// the game client, so the proxy strips them.
const HEADER_FIXES: &[HeaderFix] = &[HeaderFix {
    domain: Domain::GameCms,
    path_prefix: "/flights/active",
    header: "x-fgn-clearance",
}];

/// Headers never stored in a cache snapshot. Hop-by-hop framing belongs to
/// the connection that carried the original response, not to a replay.
const NON_CACHEABLE_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Helper to convert bytes to Body.
fn bytes_to_body(bytes: Bytes) -> Body {
    Body::from(Full::new(bytes))
}

/// Re-frames a message whose body was replaced. A stale `Content-Length`
/// makes hyper truncate or over-read the substituted payload on the wire.
fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.remove(TRANSFER_ENCODING);
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
}

/// Handler configuration.
#[derive(Clone)]
pub struct HandlerConfig {
    /// Compiled rewrite handlers, immutable after startup.
    pub routes: Arc<RouteTable>,
    /// Smart cache, present when caching is enabled.
    pub cache: Option<Arc<SmartCache>>,
    /// Outbound event stream.
    pub events: EventBus,
    /// Which traffic is surfaced as events.
    pub traffic_display: TrafficDisplay,
}

impl std::fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (request_handlers, response_handlers) = self.routes.handler_counts();
        f.debug_struct("HandlerConfig")
            .field("request_handlers", &request_handlers)
            .field("response_handlers", &response_handlers)
            .field("cache", &self.cache.is_some())
            .field("traffic_display", &self.traffic_display)
            .finish()
    }
}

/// HTTP handler for the MITM proxy.
///
/// Cloned per connection by the proxy loop; request-phase handling for a
/// given request strictly precedes its response-phase handling on the same
/// clone, which is what lets [`ProxyContext`] ride in a plain field.
#[derive(Clone, Debug)]
pub struct ProxyHandler {
    config: HandlerConfig,
    current: Option<ProxyContext>,
}

impl ProxyHandler {
    /// Creates a new proxy handler with the given configuration.
    pub fn new(config: HandlerConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    /// Extracts host from request URI or Host header.
    fn extract_host(req: &Request<Body>) -> Option<String> {
        if let Some(host) = req.uri().host() {
            return Some(host.to_string());
        }

        req.headers()
            .get(hyper::header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(|s| strip_port(s).to_string())
    }

    /// Full request URL string used for rule matching and cache keys:
    /// hostname + path + query, no scheme.
    fn request_url(host: &str, req: &Request<Body>) -> String {
        let path_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("{}{}", strip_port(host), path_query)
    }

    /// Applies the fixed header-fix exception list in place.
    fn apply_header_fixes(host: &str, path: &str, headers: &mut HeaderMap) {
        for fix in HEADER_FIXES {
            if Some(fix.domain) == Domain::from_host(host) && path.starts_with(fix.path_prefix) {
                if headers.remove(fix.header).is_some() {
                    tracing::debug!("stripped {} for {}{}", fix.header, host, path);
                }
            }
        }
    }

    /// Sets substituted rewrite headers, skipping malformed names/values.
    fn set_headers(headers: &mut HeaderMap, substituted: Vec<(String, String)>) {
        for (name, value) in substituted {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!("skipping malformed rewrite header '{}'", name),
            }
        }
    }

    fn headers_to_vec(headers: &HeaderMap) -> Vec<(String, String)> {
        headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect()
    }

    /// Builds a `200 OK` response straight from a cache entry.
    fn cached_response(entry: &CacheEntry) -> Response<Body> {
        let mut response = Response::new(bytes_to_body(Bytes::from(entry.body.clone())));
        for (name, value) in &entry.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().insert(name, value);
                }
                _ => tracing::debug!("dropping malformed cached header '{}'", name),
            }
        }
        set_content_length(response.headers_mut(), entry.body.len());
        response
            .headers_mut()
            .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("HIT"));
        Self::stamp_version(response.headers_mut());
        response
    }

    /// Header snapshot for a cache entry, with connection-scoped framing
    /// headers dropped. [`Self::cached_response`] re-frames the replay.
    fn snapshot_headers(headers: &HeaderMap) -> Vec<(String, String)> {
        headers
            .iter()
            .filter(|(name, _)| !NON_CACHEABLE_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect()
    }

    fn stamp_version(headers: &mut HeaderMap) {
        headers.insert(
            VERSION_HEADER,
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
    }

    fn emit_request(&self, ctx: &ProxyContext, headers: &HeaderMap, body: &Bytes) {
        if !self
            .config
            .traffic_display
            .should_emit(ctx.proxied(), ctx.smart_cached())
        {
            return;
        }
        self.config.events.emit(ProxyEvent::RequestSent {
            id: ctx.id,
            url: ctx.url.clone(),
            method: ctx.method.to_string(),
            headers: Self::headers_to_vec(headers),
            body: String::from_utf8_lossy(body).into_owned(),
            proxied: ctx.proxied_request,
            smart_cached: ctx.served_from_cache,
        });
    }

    fn emit_response(
        &self,
        ctx: &ProxyContext,
        status: StatusCode,
        headers: &HeaderMap,
        body: &Bytes,
    ) {
        if !self
            .config
            .traffic_display
            .should_emit(ctx.proxied(), ctx.smart_cached())
        {
            return;
        }
        self.config.events.emit(ProxyEvent::ResponseReceived {
            id: ctx.id,
            url: ctx.url.clone(),
            method: ctx.method.to_string(),
            status: status.as_u16(),
            headers: Self::headers_to_vec(headers),
            body: String::from_utf8_lossy(body).into_owned(),
            proxied: ctx.proxied(),
            smart_cached: ctx.smart_cached(),
        });
    }

    /// Request phase. Factored out of the trait impl so tests can drive it
    /// without a proxy connection.
    pub async fn process_request(&mut self, req: Request<Body>) -> RequestOrResponse {
        // A context left behind by an aborted round trip must not leak into
        // the next one.
        self.current = None;

        // OPTIONS traffic is never rewritten, cached, or surfaced.
        if req.method() == Method::OPTIONS {
            return RequestOrResponse::Request(req);
        }

        let Some(host) = Self::extract_host(&req) else {
            return RequestOrResponse::Request(req);
        };
        if !is_intercepted_host(&host) {
            return RequestOrResponse::Request(req);
        }

        let url = Self::request_url(&host, &req);
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let (mut parts, body) = req.into_parts();
        let mut body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("failed to read request body: {}", e);
                Bytes::new()
            }
        };

        Self::apply_header_fixes(&host, &path, &mut parts.headers);

        let mut ctx = ProxyContext::new(url.clone(), method.clone());

        if let Some(matched) = self.config.routes.match_request(&url, method.as_str()) {
            matched.rewrite.run_pre_hooks();
            if let Some(body) = matched.rewrite.substituted_body(&matched.captures) {
                body_bytes = Bytes::from(body);
                set_content_length(&mut parts.headers, body_bytes.len());
            }
            Self::set_headers(
                &mut parts.headers,
                matched.rewrite.substituted_headers(&matched.captures),
            );
            ctx.proxied_request = true;
        }

        // Cache lookup only when no override is in effect.
        if let Some(cache) = &self.config.cache {
            if !ctx.proxied_request && cache::is_cachable(&url, method.as_str()) {
                let accept = header_str(&parts.headers, &ACCEPT);
                let language = header_str(&parts.headers, &ACCEPT_LANGUAGE);
                let key = cache::create_key(&url, &accept, &language);

                ctx.cache = Some(Arc::clone(cache));
                ctx.cache_key = Some(key.clone());

                if let Some(entry) = cache.read(&key) {
                    ctx.served_from_cache = true;
                    tracing::debug!("smart cache hit for {}", url);

                    self.emit_request(&ctx, &parts.headers, &body_bytes);
                    let response = Self::cached_response(&entry);
                    self.emit_response(
                        &ctx,
                        response.status(),
                        response.headers(),
                        &Bytes::from(entry.body.clone()),
                    );
                    return RequestOrResponse::Response(response);
                }
            }
        }

        // A rewritten request must never be satisfied by a stale cached
        // artifact, locally or upstream.
        if ctx.proxied_request {
            parts
                .headers
                .insert(CACHE_CONTROL, HeaderValue::from_static(REQUEST_NO_CACHE));
            parts
                .headers
                .insert(PRAGMA, HeaderValue::from_static("no-cache"));
        }

        self.emit_request(&ctx, &parts.headers, &body_bytes);
        self.current = Some(ctx);

        RequestOrResponse::Request(Request::from_parts(parts, bytes_to_body(body_bytes)))
    }

    /// Response phase, mirroring [`Self::process_request`].
    pub async fn process_response(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(mut ctx) = self.current.take() else {
            return res;
        };

        let (mut parts, body) = res.into_parts();
        let mut body_bytes = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("failed to read response body: {}", e);
                Bytes::new()
            }
        };

        if let Some(matched) = self
            .config
            .routes
            .match_response(&ctx.url, ctx.method.as_str())
        {
            matched.rewrite.run_pre_hooks();
            if let Some(body) = matched.rewrite.substituted_body(&matched.captures) {
                body_bytes = Bytes::from(body);
                set_content_length(&mut parts.headers, body_bytes.len());
            }
            Self::set_headers(
                &mut parts.headers,
                matched.rewrite.substituted_headers(&matched.captures),
            );
            if let Some(status) = matched.rewrite.status {
                match StatusCode::from_u16(status) {
                    Ok(status) => parts.status = status,
                    Err(_) => tracing::warn!("ignoring invalid status override {}", status),
                }
            }
            ctx.proxied_response = true;
        }

        // Store cacheable misses on a clean 2xx. The snapshot is taken
        // before the marker and no-cache headers go on, so a cache-served
        // replay stamps HIT and keeps the upstream's caching metadata.
        if let (Some(cache), Some(key)) = (&ctx.cache, &ctx.cache_key) {
            if !ctx.served_from_cache && parts.status.is_success() {
                let entry = CacheEntry::new(
                    body_bytes.to_vec(),
                    Self::snapshot_headers(&parts.headers),
                );
                cache.write(key, entry);
                parts
                    .headers
                    .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("MISS"));
                ctx.stored_to_cache = true;
            }
        }

        if ctx.proxied() {
            parts
                .headers
                .insert(CACHE_CONTROL, HeaderValue::from_static(RESPONSE_NO_CACHE));
            parts
                .headers
                .insert(PRAGMA, HeaderValue::from_static("no-cache"));
        }

        Self::stamp_version(&mut parts.headers);

        self.emit_response(&ctx, parts.status, &parts.headers, &body_bytes);

        // The body is always restored onto the outgoing response, whether or
        // not an event was emitted.
        Response::from_parts(parts, bytes_to_body(body_bytes))
    }
}

fn header_str(headers: &HeaderMap, name: &HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

impl HttpHandler for ProxyHandler {
    async fn should_intercept(&mut self, _ctx: &HttpContext, req: &Request<Body>) -> bool {
        // CONNECT phase: only the configured umbrella is TLS-intercepted;
        // everything else tunnels through encrypted and untouched.
        Self::extract_host(req)
            .map(|host| is_intercepted_host(&host))
            .unwrap_or(false)
    }

    async fn handle_request(
        &mut self,
        _ctx: &HttpContext,
        req: Request<Body>,
    ) -> RequestOrResponse {
        self.process_request(req).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.process_response(res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfarer_core::{Config, SmartCacheOptions};

    fn handler_with(yaml: &str, cache: Option<Arc<SmartCache>>) -> ProxyHandler {
        let routes = match yaml.is_empty() {
            true => RouteTable::empty(),
            false => {
                let config = Config::from_yaml(yaml).unwrap();
                RouteTable::from_config(&config).unwrap()
            }
        };
        ProxyHandler::new(HandlerConfig {
            routes: Arc::new(routes),
            cache,
            events: EventBus::new(),
            traffic_display: TrafficDisplay::All,
        })
    }

    fn get(url: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Body::empty())
            .unwrap()
    }

    fn upstream_response(body: &'static str) -> Response<Body> {
        Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .header("date", "Mon, 01 Jan 2024 00:00:00 GMT")
            .body(bytes_to_body(Bytes::from(body)))
            .unwrap()
    }

    async fn body_string(body: Body) -> String {
        let bytes = body.collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    const SETTINGS_REWRITE: &str = r#"
version: 1
domains:
  settings:
    - path: /settings/foo/{guid}
      methods: [GET]
      response:
        headers:
          X-Test: "feature $1"
"#;

    // Scenario A: response rewrite sets a path-derived header and forces
    // no-cache directives.
    #[tokio::test]
    async fn response_rewrite_sets_header_and_no_cache() {
        let mut handler = handler_with(SETTINGS_REWRITE, None);

        let req = get(
            "https://settings.svc.frontier-games.net/settings/foo/0f7e8a6c-2d3b-4a1e-9c5d-8b7a6f5e4d3c",
        );
        let forwarded = match handler.process_request(req).await {
            RequestOrResponse::Request(req) => req,
            RequestOrResponse::Response(_) => panic!("expected pass-through request"),
        };
        // Request phase must not rewrite anything for a response-only rule.
        assert!(forwarded.headers().get(CACHE_CONTROL).is_none());

        let res = handler.process_response(upstream_response("{}")).await;
        assert_eq!(
            res.headers().get("x-test").unwrap(),
            "feature 0f7e8a6c-2d3b-4a1e-9c5d-8b7a6f5e4d3c"
        );
        assert_eq!(
            res.headers().get(CACHE_CONTROL).unwrap(),
            "no-store, no-cache, must-revalidate, max-age=0"
        );
        assert!(res.headers().contains_key(VERSION_HEADER));
    }

    // Scenario B: first eligible GET stores with a MISS marker; an identical
    // second request is served from the cache without an upstream dial.
    #[tokio::test]
    async fn cache_miss_then_hit() {
        let cache = Arc::new(SmartCache::new(
            &SmartCacheOptions::default(),
            "/tmp/wayfarer-test-unused",
        ));
        let mut handler = handler_with("", Some(Arc::clone(&cache)));
        let url = "https://settings.svc.frontier-games.net/settings/features";

        match handler.process_request(get(url)).await {
            RequestOrResponse::Request(_) => {}
            RequestOrResponse::Response(_) => panic!("first request must go upstream"),
        }

        let res = handler.process_response(upstream_response("{\"a\":1}")).await;
        assert_eq!(res.headers().get(CACHE_STATUS_HEADER).unwrap(), "MISS");
        assert_eq!(cache.len(), 1);

        match handler.process_request(get(url)).await {
            RequestOrResponse::Response(res) => {
                assert_eq!(res.status(), StatusCode::OK);
                assert_eq!(res.headers().get(CACHE_STATUS_HEADER).unwrap(), "HIT");
                assert_eq!(body_string(res.into_body()).await, "{\"a\":1}");
            }
            RequestOrResponse::Request(_) => panic!("second request must be cache-served"),
        }
    }

    // Scenario C: a GET-only rule does not match a POST.
    #[tokio::test]
    async fn method_mismatch_passes_through_unrewritten() {
        let mut handler = handler_with(SETTINGS_REWRITE, None);

        let req = Request::builder()
            .method(Method::POST)
            .uri("https://settings.svc.frontier-games.net/settings/foo/0f7e8a6c-2d3b-4a1e-9c5d-8b7a6f5e4d3c")
            .body(Body::empty())
            .unwrap();
        match handler.process_request(req).await {
            RequestOrResponse::Request(_) => {}
            RequestOrResponse::Response(_) => panic!("POST must pass through"),
        }

        let res = handler.process_response(upstream_response("{}")).await;
        assert!(res.headers().get("x-test").is_none());
        assert!(res.headers().get(CACHE_CONTROL).is_none());
    }

    #[tokio::test]
    async fn options_requests_are_skipped_entirely() {
        let mut handler = handler_with(SETTINGS_REWRITE, None);
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("https://settings.svc.frontier-games.net/settings/foo/0f7e8a6c-2d3b-4a1e-9c5d-8b7a6f5e4d3c")
            .body(Body::empty())
            .unwrap();
        match handler.process_request(req).await {
            RequestOrResponse::Request(_) => {}
            RequestOrResponse::Response(_) => panic!("OPTIONS must pass through"),
        }
        // No context means the response phase is a no-op.
        let res = handler.process_response(upstream_response("{}")).await;
        assert!(res.headers().get(CACHE_STATUS_HEADER).is_none());
        assert!(res.headers().get(VERSION_HEADER).is_none());
    }

    #[tokio::test]
    async fn non_umbrella_hosts_are_untouched() {
        let mut handler = handler_with(SETTINGS_REWRITE, None);
        match handler.process_request(get("https://example.com/settings/foo")).await {
            RequestOrResponse::Request(req) => {
                assert!(req.headers().get(CACHE_CONTROL).is_none());
            }
            RequestOrResponse::Response(_) => panic!("must pass through"),
        }
    }

    #[tokio::test]
    async fn rewritten_request_carries_no_cache_headers() {
        let yaml = r#"
version: 1
domains:
  gamecms:
    - path: /content/{*}
      request:
        headers: {X-Injected: "yes"}
"#;
        let mut handler = handler_with(yaml, None);
        let req = get("https://gamecms.svc.frontier-games.net/content/anything");
        match handler.process_request(req).await {
            RequestOrResponse::Request(req) => {
                assert_eq!(req.headers().get("x-injected").unwrap(), "yes");
                assert_eq!(
                    req.headers().get(CACHE_CONTROL).unwrap(),
                    "no-store, no-cache, must-revalidate"
                );
                assert_eq!(req.headers().get(PRAGMA).unwrap(), "no-cache");
            }
            RequestOrResponse::Response(_) => panic!("expected forwarded request"),
        }
    }

    #[tokio::test]
    async fn header_fix_strips_clearance_on_flight_endpoint() {
        let mut handler = handler_with("", None);
        let req = Request::builder()
            .method(Method::GET)
            .uri("https://gamecms.svc.frontier-games.net/flights/active")
            .header("x-fgn-clearance", "stale-token")
            .body(Body::empty())
            .unwrap();
        match handler.process_request(req).await {
            RequestOrResponse::Request(req) => {
                assert!(req.headers().get("x-fgn-clearance").is_none());
            }
            RequestOrResponse::Response(_) => panic!("expected forwarded request"),
        }

        // Same header on a different endpoint survives.
        let mut handler = handler_with("", None);
        let req = Request::builder()
            .method(Method::GET)
            .uri("https://gamecms.svc.frontier-games.net/content/foo")
            .header("x-fgn-clearance", "token")
            .body(Body::empty())
            .unwrap();
        match handler.process_request(req).await {
            RequestOrResponse::Request(req) => {
                assert_eq!(req.headers().get("x-fgn-clearance").unwrap(), "token");
            }
            RequestOrResponse::Response(_) => panic!("expected forwarded request"),
        }
    }

    #[tokio::test]
    async fn status_override_applies() {
        let yaml = r#"
version: 1
domains:
  economy:
    - path: /store/offers
      response:
        status: 404
        body: "gone"
"#;
        let mut handler = handler_with(yaml, None);
        let req = get("https://economy.svc.frontier-games.net/store/offers");
        match handler.process_request(req).await {
            RequestOrResponse::Request(_) => {}
            RequestOrResponse::Response(_) => panic!(),
        }
        let res = handler.process_response(upstream_response("{}")).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(res.into_body()).await, "gone");
    }

    #[tokio::test]
    async fn events_are_emitted_with_correlated_ids() {
        let mut handler = handler_with(SETTINGS_REWRITE, None);
        let mut rx = handler.config.events.subscribe();

        let req = get(
            "https://settings.svc.frontier-games.net/settings/foo/0f7e8a6c-2d3b-4a1e-9c5d-8b7a6f5e4d3c",
        );
        let _ = handler.process_request(req).await;
        let _ = handler.process_response(upstream_response("{}")).await;

        let request_id = match rx.recv().await.unwrap() {
            ProxyEvent::RequestSent { id, proxied, .. } => {
                assert!(!proxied);
                id
            }
            other => panic!("unexpected event: {:?}", other),
        };
        match rx.recv().await.unwrap() {
            ProxyEvent::ResponseReceived { id, proxied, status, .. } => {
                assert_eq!(id, request_id);
                assert!(proxied);
                assert_eq!(status, 200);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_policy_emits_nothing() {
        let config = Config::from_yaml(SETTINGS_REWRITE).unwrap();
        let mut handler = ProxyHandler::new(HandlerConfig {
            routes: Arc::new(RouteTable::from_config(&config).unwrap()),
            cache: None,
            events: EventBus::new(),
            traffic_display: TrafficDisplay::Silent,
        });
        let mut rx = handler.config.events.subscribe();

        let req = get(
            "https://settings.svc.frontier-games.net/settings/foo/0f7e8a6c-2d3b-4a1e-9c5d-8b7a6f5e4d3c",
        );
        let _ = handler.process_request(req).await;
        let _ = handler.process_response(upstream_response("{}")).await;

        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn cached_hit_emits_request_and_response_events() {
        let cache = Arc::new(SmartCache::new(
            &SmartCacheOptions::default(),
            "/tmp/wayfarer-test-unused",
        ));
        let mut handler = handler_with("", Some(Arc::clone(&cache)));
        let url = "https://profile.svc.frontier-games.net/players/pid(1)/appearance";

        let _ = handler.process_request(get(url)).await;
        let _ = handler.process_response(upstream_response("{\"p\":1}")).await;

        let mut rx = handler.config.events.subscribe();
        match handler.process_request(get(url)).await {
            RequestOrResponse::Response(_) => {}
            RequestOrResponse::Request(_) => panic!("expected cache hit"),
        }

        match rx.recv().await.unwrap() {
            ProxyEvent::RequestSent { smart_cached, .. } => assert!(smart_cached),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ProxyEvent::ResponseReceived { smart_cached, status, .. } => {
                assert!(smart_cached);
                assert_eq!(status, 200);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    // A replaced body invalidates the upstream's framing: the declared
    // length must follow the substituted payload or hyper truncates it.
    #[tokio::test]
    async fn response_body_rewrite_refreshes_content_length() {
        let yaml = r#"
version: 1
domains:
  economy:
    - path: /store/offers
      response:
        body: '{"offers": [], "reason": "empty"}'
"#;
        let mut handler = handler_with(yaml, None);
        let req = get("https://economy.svc.frontier-games.net/store/offers");
        match handler.process_request(req).await {
            RequestOrResponse::Request(_) => {}
            RequestOrResponse::Response(_) => panic!("expected forwarded request"),
        }

        let upstream = Response::builder()
            .status(200)
            .header("content-length", "2")
            .header("transfer-encoding", "chunked")
            .body(bytes_to_body(Bytes::from("{}")))
            .unwrap();
        let res = handler.process_response(upstream).await;

        let body = body_string(res.into_body()).await;
        assert_eq!(body, "{\"offers\": [], \"reason\": \"empty\"}");
    }

    #[tokio::test]
    async fn response_body_rewrite_reframes_headers() {
        let yaml = r#"
version: 1
domains:
  economy:
    - path: /store/offers
      response:
        body: '{"offers": [], "reason": "empty"}'
"#;
        let mut handler = handler_with(yaml, None);
        let _ = handler
            .process_request(get("https://economy.svc.frontier-games.net/store/offers"))
            .await;

        let upstream = Response::builder()
            .status(200)
            .header("content-length", "2")
            .header("transfer-encoding", "chunked")
            .body(bytes_to_body(Bytes::from("{}")))
            .unwrap();
        let res = handler.process_response(upstream).await;

        let declared: usize = res
            .headers()
            .get(CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, "{\"offers\": [], \"reason\": \"empty\"}".len());
        assert!(res.headers().get(TRANSFER_ENCODING).is_none());
    }

    #[tokio::test]
    async fn request_body_rewrite_reframes_headers() {
        let yaml = r#"
version: 1
domains:
  stats:
    - path: /matches/report
      request:
        body: '{"forced": true, "payload": "overridden"}'
"#;
        let mut handler = handler_with(yaml, None);
        let req = Request::builder()
            .method(Method::POST)
            .uri("https://stats.svc.frontier-games.net/matches/report")
            .header("content-length", "2")
            .body(bytes_to_body(Bytes::from("{}")))
            .unwrap();

        match handler.process_request(req).await {
            RequestOrResponse::Request(req) => {
                let declared: usize = req
                    .headers()
                    .get(CONTENT_LENGTH)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .parse()
                    .unwrap();
                assert_eq!(declared, "{\"forced\": true, \"payload\": \"overridden\"}".len());
            }
            RequestOrResponse::Response(_) => panic!("expected forwarded request"),
        }
    }

    // Connection-scoped framing and forced no-cache directives belong to the
    // round trip that produced the entry, never to a replay.
    #[tokio::test]
    async fn cached_replay_carries_fresh_framing() {
        let yaml = r#"
version: 1
domains:
  settings:
    - path: /settings/features
      response:
        headers: {X-Patched: "1"}
"#;
        let cache = Arc::new(SmartCache::new(
            &SmartCacheOptions::default(),
            "/tmp/wayfarer-test-unused",
        ));
        let mut handler = handler_with(yaml, Some(Arc::clone(&cache)));
        let url = "https://settings.svc.frontier-games.net/settings/features";

        let _ = handler.process_request(get(url)).await;
        let upstream = Response::builder()
            .status(200)
            .header("content-length", "7")
            .header("transfer-encoding", "chunked")
            .header("connection", "keep-alive")
            .body(bytes_to_body(Bytes::from("{\"a\":1}")))
            .unwrap();
        let res = handler.process_response(upstream).await;
        // The outgoing rewritten response is forced no-cache as usual.
        assert_eq!(res.headers().get(CACHE_CONTROL).unwrap(), RESPONSE_NO_CACHE);

        match handler.process_request(get(url)).await {
            RequestOrResponse::Response(res) => {
                assert_eq!(res.headers().get(CACHE_STATUS_HEADER).unwrap(), "HIT");
                assert_eq!(res.headers().get("x-patched").unwrap(), "1");
                assert!(res.headers().get(TRANSFER_ENCODING).is_none());
                assert!(res.headers().get("connection").is_none());
                assert!(res.headers().get(CACHE_CONTROL).is_none());
                let declared: usize = res
                    .headers()
                    .get(CONTENT_LENGTH)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .parse()
                    .unwrap();
                assert_eq!(declared, "{\"a\":1}".len());
            }
            RequestOrResponse::Request(_) => panic!("expected cache hit"),
        }
    }

    #[tokio::test]
    async fn non_2xx_responses_are_not_cached() {
        let cache = Arc::new(SmartCache::new(
            &SmartCacheOptions::default(),
            "/tmp/wayfarer-test-unused",
        ));
        let mut handler = handler_with("", Some(Arc::clone(&cache)));
        let url = "https://settings.svc.frontier-games.net/settings/bad";

        let _ = handler.process_request(get(url)).await;
        let res = Response::builder()
            .status(503)
            .body(bytes_to_body(Bytes::from("upstream sad")))
            .unwrap();
        let res = handler.process_response(res).await;
        assert!(res.headers().get(CACHE_STATUS_HEADER).is_none());
        assert!(cache.is_empty());
    }
}
