use std::collections::HashMap;
use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_sdk_dynamodb as ddb;
use lambda_http::request::RequestContext;
use lambda_http::{Body, Error, Request, RequestExt, Response};
use serde_json::json;

use crate::{
    config::Settings,
    engine::{AllocationEngine, EngineOptions, ResolveError},
    model::{AllocationResult, RequestMeta, ResolveResp},
    store::ddb::{DdbAnalytics, DdbStore},
    util::{json_err, resp_json},
};

#[derive(Clone)]
pub struct Ctx {
    pub engine: AllocationEngine,
    pub retry_after_secs: u64,
}

impl Ctx {
    pub async fn new() -> Result<Self, Error> {
        let settings = Settings::from_env().map_err(|e| Error::from(format!("config: {e}")))?;
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let client = ddb::Client::new(&config);

        let store = Arc::new(DdbStore::new(client.clone(), &settings));
        let analytics = Arc::new(DdbAnalytics::new(client, &settings));
        let engine = AllocationEngine::new(store, analytics, EngineOptions::from(&settings));
        Ok(Self::with_engine(engine, &settings))
    }

    pub fn with_engine(engine: AllocationEngine, settings: &Settings) -> Self {
        Self {
            engine,
            retry_after_secs: settings.retry_after_secs,
        }
    }
}

pub async fn router(req: Request, ctx: &Ctx) -> Result<Response<Body>, Error> {
    let method = req.method().as_str();
    let path = req.uri().path();

    match (method, path) {
        ("GET", "/healthz") => Ok(resp_json(200, json!({"status": "ok"}))),
        ("GET", "/resolve") => resolve_json(req, ctx).await,
        ("GET", "/") => not_found(),
        ("GET", _) => resolve_redirect(req, ctx).await,
        _ => json_err(405, "method_not_allowed", "Only GET is supported"),
    }
}

async fn resolve_json(req: Request, ctx: &Ctx) -> Result<Response<Body>, Error> {
    let qp = req.uri().query().unwrap_or("");
    let params: HashMap<_, _> = url::form_urlencoded::parse(qp.as_bytes())
        .into_owned()
        .collect();
    let slug = params.get("slug").map(|s| s.trim()).unwrap_or_default();
    if slug.is_empty() {
        return json_err(400, "bad_request", "Missing slug");
    }

    let meta = request_meta(&req);
    match ctx.engine.resolve(slug, &meta).await {
        Ok(AllocationResult::Allocated {
            destination,
            candidate_id,
        }) => {
            let out = ResolveResp {
                destination,
                candidate_id,
            };
            let body = serde_json::to_value(out).map_err(|e| Error::from(e.to_string()))?;
            Ok(resp_json(200, body))
        }
        Ok(AllocationResult::Exhausted) => exhausted(ctx),
        Err(e) => resolve_err(e),
    }
}

async fn resolve_redirect(req: Request, ctx: &Ctx) -> Result<Response<Body>, Error> {
    let raw = req.uri().path().trim_start_matches('/');
    let Ok(slug) = urlencoding::decode(raw) else {
        return not_found();
    };
    if slug.is_empty() || slug.contains('/') {
        return not_found();
    }
    let slug = slug.into_owned();

    let meta = request_meta(&req);
    match ctx.engine.resolve(&slug, &meta).await {
        Ok(AllocationResult::Allocated { destination, .. }) => Response::builder()
            .status(302)
            .header("Location", destination)
            // each hit is a fresh allocation; edges must not replay it
            .header("Cache-Control", "no-store")
            .body(Body::Empty)
            .map_err(|e| Error::from(format!("resp: {e}"))),
        Ok(AllocationResult::Exhausted) => exhausted(ctx),
        Err(e) => resolve_err(e),
    }
}

fn exhausted(ctx: &Ctx) -> Result<Response<Body>, Error> {
    let body = json!({
        "outcome": "exhausted",
        "retry_after_secs": ctx.retry_after_secs,
    });
    Response::builder()
        .status(503)
        .header("content-type", "application/json")
        .header("Cache-Control", "no-store")
        .header("Retry-After", ctx.retry_after_secs.to_string())
        .body(Body::Text(body.to_string()))
        .map_err(|e| Error::from(format!("resp: {e}")))
}

fn resolve_err(e: ResolveError) -> Result<Response<Body>, Error> {
    match e {
        // Same response for both to avoid leaking which slugs exist
        ResolveError::NotFound(_) | ResolveError::Inactive(_) => not_found(),
        ResolveError::StorageUnavailable(_) => {
            json_err(e.status(), "storage_unavailable", "Try again shortly")
        }
    }
}

fn not_found() -> Result<Response<Body>, Error> {
    json_err(404, "not_found", "Slug not found")
}

/// Client address and agent. API Gateway v2 context first, then the
/// leftmost `X-Forwarded-For` hop.
pub(crate) fn request_meta(req: &Request) -> RequestMeta {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let from_ctx = match req.request_context_ref() {
        Some(RequestContext::ApiGatewayV2(c)) => c.http.source_ip.clone(),
        _ => None,
    };
    let source_ip = from_ctx.or_else(|| {
        header("x-forwarded-for").and_then(|v| {
            v.split(',')
                .next()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    });

    RequestMeta {
        source_ip,
        user_agent: header("user-agent"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CandidateList, CandidateRef, RedirectLink};
    use crate::store::memory::{MemoryAnalytics, MemoryStore};

    fn settings() -> Settings {
        Settings::from_lookup(|k| match k {
            "TABLE_LINKS" => Some("links".into()),
            "TABLE_CANDIDATES" => Some("cands".into()),
            "TABLE_EVENTS" => Some("events".into()),
            "DESTINATION_BASE" => Some("https://chat.example.com/".into()),
            "RETRY_AFTER_SECS" => Some("45".into()),
            _ => None,
        })
        .unwrap()
    }

    fn setup() -> (Ctx, Arc<MemoryStore>, Arc<MemoryAnalytics>) {
        let store = Arc::new(MemoryStore::new());
        let analytics = Arc::new(MemoryAnalytics::new());
        let cands = ["g1", "g2"]
            .iter()
            .enumerate()
            .map(|(i, id)| CandidateRef {
                candidate_id: id.to_string(),
                display_name: id.to_string(),
                priority: i as i64 + 1,
                external_ref: format!("inv-{id}"),
            })
            .collect();
        store.put_link(RedirectLink {
            id: "L1".into(),
            slug: "promo".into(),
            candidates: CandidateList::from_authored(cands),
            active: true,
            total_clicks: 0,
        });
        store.put_link(RedirectLink {
            id: "L2".into(),
            slug: "retired".into(),
            candidates: CandidateList::default(),
            active: false,
            total_clicks: 3,
        });
        let s = settings();
        let engine =
            AllocationEngine::new(store.clone(), analytics.clone(), EngineOptions::from(&s));
        (Ctx::with_engine(engine, &s), store, analytics)
    }

    fn put_g1_link(store: &MemoryStore, id: &str, slug: &str) {
        let g1 = CandidateRef {
            candidate_id: "g1".into(),
            display_name: "g1".into(),
            priority: 1,
            external_ref: "inv-g1".into(),
        };
        store.put_link(RedirectLink {
            id: id.into(),
            slug: slug.into(),
            candidates: CandidateList::from_authored(vec![g1]),
            active: true,
            total_clicks: 0,
        });
    }

    fn get(uri: &str) -> Request {
        lambda_http::http::Request::builder()
            .method("GET")
            .uri(uri)
            .header("user-agent", "test-agent")
            .header("x-forwarded-for", "192.0.2.10, 10.0.0.1")
            .body(Body::Empty)
            .unwrap()
    }

    fn body_json(resp: &Response<Body>) -> serde_json::Value {
        match resp.body() {
            Body::Text(s) => serde_json::from_str(s).unwrap(),
            Body::Binary(b) => serde_json::from_slice(b).unwrap(),
            _ => serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn resolve_returns_destination() {
        let (ctx, store, analytics) = setup();
        store.set_live("g1", 5, 5);
        store.set_live("g2", 2, 10);

        let resp = router(get("/resolve?slug=promo"), &ctx).await.unwrap();
        assert_eq!(resp.status(), 200);
        let v = body_json(&resp);
        assert_eq!(v["candidateId"], "g2");
        assert_eq!(v["destination"], "https://chat.example.com/inv-g2");
        assert_eq!(analytics.events().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_is_503_with_retry_hint() {
        let (ctx, store, analytics) = setup();
        store.set_live("g1", 5, 5);
        store.set_live("g2", 10, 10);

        let resp = router(get("/resolve?slug=promo"), &ctx).await.unwrap();
        assert_eq!(resp.status(), 503);
        assert_eq!(resp.headers()["Retry-After"], "45");
        assert_eq!(body_json(&resp)["outcome"], "exhausted");
        assert_eq!(analytics.events().len(), 1);
    }

    #[tokio::test]
    async fn unknown_and_inactive_are_indistinguishable() {
        let (ctx, store, analytics) = setup();
        store.set_live("g1", 0, 5);

        let missing = router(get("/resolve?slug=ghost"), &ctx).await.unwrap();
        let retired = router(get("/resolve?slug=retired"), &ctx).await.unwrap();
        assert_eq!(missing.status(), 404);
        assert_eq!(retired.status(), 404);
        assert_eq!(body_json(&missing), body_json(&retired));
        assert!(analytics.events().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_is_502() {
        let (ctx, store, analytics) = setup();
        store.fail_reads(true);
        let resp = router(get("/resolve?slug=promo"), &ctx).await.unwrap();
        assert_eq!(resp.status(), 502);
        assert_eq!(body_json(&resp)["error"], "storage_unavailable");
        assert!(analytics.events().is_empty());
    }

    #[tokio::test]
    async fn missing_slug_is_400() {
        let (ctx, _, analytics) = setup();
        let resp = router(get("/resolve"), &ctx).await.unwrap();
        assert_eq!(resp.status(), 400);
        let resp = router(get("/resolve?slug=%20"), &ctx).await.unwrap();
        assert_eq!(resp.status(), 400);
        assert!(analytics.events().is_empty());
    }

    #[tokio::test]
    async fn path_form_redirects_without_caching() {
        let (ctx, store, _) = setup();
        store.set_live("g1", 0, 5);
        let resp = router(get("/promo"), &ctx).await.unwrap();
        assert_eq!(resp.status(), 302);
        assert_eq!(resp.headers()["Location"], "https://chat.example.com/inv-g1");
        assert_eq!(resp.headers()["Cache-Control"], "no-store");
    }

    #[tokio::test]
    async fn reserved_paths_and_methods() {
        let (ctx, _, _) = setup();
        assert_eq!(router(get("/"), &ctx).await.unwrap().status(), 404);
        assert_eq!(router(get("/v1/links"), &ctx).await.unwrap().status(), 404);
        assert_eq!(router(get("/healthz"), &ctx).await.unwrap().status(), 200);

        let post = lambda_http::http::Request::builder()
            .method("POST")
            .uri("/resolve?slug=promo")
            .body(Body::Empty)
            .unwrap();
        assert_eq!(router(post, &ctx).await.unwrap().status(), 405);
    }

    #[tokio::test]
    async fn fingerprint_uses_first_forwarded_hop() {
        let meta = request_meta(&get("/promo"));
        assert_eq!(meta.source_ip.as_deref(), Some("192.0.2.10"));
        assert_eq!(meta.user_agent.as_deref(), Some("test-agent"));

        let (ctx, store, analytics) = setup();
        store.set_live("g1", 0, 5);
        router(get("/promo"), &ctx).await.unwrap();
        assert!(analytics.events()[0].requester_fingerprint.is_some());
    }

    #[tokio::test]
    async fn top_level_slugs_are_not_reserved() {
        let (ctx, store, _) = setup();
        store.set_live("g1", 0, 5);
        put_g1_link(&store, "L3", "v1");
        assert_eq!(router(get("/v1"), &ctx).await.unwrap().status(), 302);
    }

    #[tokio::test]
    async fn encoded_slugs_resolve_in_both_forms() {
        let (ctx, store, analytics) = setup();
        store.set_live("g1", 0, 5);
        put_g1_link(&store, "L4", "café");

        let resp = router(get("/caf%C3%A9"), &ctx).await.unwrap();
        assert_eq!(resp.status(), 302);
        let resp = router(get("/resolve?slug=caf%C3%A9"), &ctx).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert!(analytics.events().iter().all(|e| e.link_id == "L4"));

        // an encoded separator is still not a slug
        assert_eq!(router(get("/a%2Fb"), &ctx).await.unwrap().status(), 404);
        assert_eq!(router(get("/%FF"), &ctx).await.unwrap().status(), 404);
    }
}
