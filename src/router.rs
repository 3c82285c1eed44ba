use axum::{
    extract::{ws::WebSocketUpgrade, FromRequestParts, Request, State},
    http::{
        header::{HeaderName, HeaderValue, UPGRADE},
        Method, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
    Router,
};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{agent::instance::Command, AgentHost, Cors};

/// The axum router for a host: every path funnels through the fallback so
/// the URL grammar stays in one place.
pub(crate) fn build_router(host: AgentHost) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(host)
        // Log the request method, path, response status, and response time
        .layer(TraceLayer::new_for_http())
}

async fn dispatch(State(host): State<AgentHost>, req: Request) -> Response {
    match route(&host, req).await {
        Some(response) => response,
        // Not an agent URL; nothing for the router to say
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Split a path against `/<prefix>/<class>/<name>[/<tail>]`. The tail keeps
/// its leading slash so the instance sees a rooted path.
fn match_path(prefix: &str, path: &str) -> Option<(String, String, String)> {
    let mut segments = path.strip_prefix('/')?.splitn(4, '/');
    if segments.next()? != prefix {
        return None;
    }
    let class = segments.next()?;
    let name = segments.next()?;
    if class.is_empty() || name.is_empty() {
        return None;
    }
    let tail = match segments.next() {
        Some(tail) => format!("/{tail}"),
        None => "/".to_owned(),
    };
    Some((class.to_owned(), name.to_owned(), tail))
}

/// Resolve and forward a request. `None` means the URL doesn't name an
/// agent and the caller should fall back.
pub(crate) async fn route(host: &AgentHost, req: Request) -> Option<Response> {
    let path = req.uri().path().to_owned();
    let (class, name, tail) = match_path(&host.inner.options.prefix, &path)?;
    if !host.has_class(&class) {
        return None;
    }

    // CORS preflight answers at the router; the configured headers are
    // echoed exactly as given
    if req.method() == Method::OPTIONS && !matches!(host.inner.options.cors, Cors::Disabled) {
        return Some(cors_response(&host.inner.options.cors));
    }

    let (mut parts, body) = req.into_parts();

    if parts.headers.contains_key(UPGRADE) {
        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => return Some(rejection.into_response()),
        };
        let host = host.clone();
        return Some(upgrade.on_upgrade(move |socket| async move {
            if let Err(e) = host
                .send_command(&class, &name, Command::Attach { socket })
                .await
            {
                warn!(class = %class, name = %name, error = %e, "failed to attach websocket");
            }
        }));
    }

    // The instance sees the tail as its request path
    let rewritten = match parts.uri.query() {
        Some(query) => format!("{tail}?{query}"),
        None => tail,
    };
    match rewritten.parse::<Uri>() {
        Ok(uri) => parts.uri = uri,
        Err(_) => return Some(StatusCode::BAD_REQUEST.into_response()),
    }
    let req = Request::from_parts(parts, body);

    let (reply, rx) = oneshot::channel();
    if let Err(e) = host
        .send_command(&class, &name, Command::Request { req, reply })
        .await
    {
        return Some(e.into_response());
    }
    match rx.await {
        Ok(response) => Some(response),
        // The instance died mid-request
        Err(_) => Some(StatusCode::INTERNAL_SERVER_ERROR.into_response()),
    }
}

fn cors_response(cors: &Cors) -> Response {
    let mut response = StatusCode::OK.into_response();
    let headers = response.headers_mut();
    match cors {
        Cors::Defaults => {
            headers.insert(
                HeaderName::from_static("access-control-allow-origin"),
                HeaderValue::from_static("*"),
            );
            headers.insert(
                HeaderName::from_static("access-control-allow-methods"),
                HeaderValue::from_static("GET, POST, HEAD, OPTIONS"),
            );
            headers.insert(
                HeaderName::from_static("access-control-allow-credentials"),
                HeaderValue::from_static("true"),
            );
        }
        Cors::Headers(configured) => {
            for (key, value) in configured {
                let Ok(key) = key.parse::<HeaderName>() else {
                    warn!(header = %key, "skipping invalid CORS header name");
                    continue;
                };
                let Ok(value) = HeaderValue::from_str(value) else {
                    warn!(header = %key, "skipping invalid CORS header value");
                    continue;
                };
                headers.insert(key, value);
            }
        }
        Cors::Disabled => {}
    }
    response
}
