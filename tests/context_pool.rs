// Pooled contexts never carry state from one request into the next
use std::sync::Arc;

use axum::body::Body as AxumBody;
use hyper::{Method, Request, StatusCode, http::request::Parts};
use proptest::prelude::*;
use trellis::core::{
    context::{ContextServices, RequestContext},
    pool::ContextPool,
};

fn parts(method: Method, uri: &str) -> Parts {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("user-agent", "pool-test")
        .body(())
        .unwrap()
        .into_parts()
        .0
}

fn services() -> Arc<ContextServices> {
    Arc::new(ContextServices::default())
}

#[test]
fn test_thousand_cycles_never_leak() {
    let pool = ContextPool::new(2, services());

    for i in 0..1000 {
        let method = if i % 2 == 0 { Method::GET } else { Method::POST };
        let mut ctx = pool.acquire(parts(method, &format!("/items/{i}")), None);

        assert!(ctx.input.params().is_empty(), "params leaked at {i}");
        assert!(ctx.input.data("owner").is_none(), "data leaked at {i}");
        assert!(!ctx.response.started(), "started flag leaked at {i}");
        assert!(ctx.output.status().is_none());
        assert!(ctx.output.headers().is_empty());
        assert!(ctx.view.flash.is_empty());

        ctx.input.set_param("id", i.to_string());
        ctx.input.set_data("owner", i);
        ctx.output.set_status(StatusCode::CREATED);
        ctx.view.flash.insert("notice".to_string(), format!("msg {i}"));
        if i % 3 == 0 {
            ctx.text(StatusCode::OK, format!("body {i}"));
        }
        if i % 5 == 0 {
            ctx.release();
        }
    }

    let stats = pool.stats();
    assert_eq!(stats.created, 1);
    assert_eq!(stats.idle, 1);
}

#[test]
fn test_interleaved_occupants_stay_isolated() {
    let pool = ContextPool::new(8, services());

    for round in 0..250 {
        let mut first = pool.acquire(parts(Method::GET, "/a"), None);
        let mut second = pool.acquire(parts(Method::GET, "/b"), None);
        assert!(first.input.params().is_empty());
        assert!(second.input.params().is_empty());

        first.input.set_param("who", "first");
        second.input.set_param("who", "second");
        first.write(format!("round {round}"));
        assert_eq!(first.input.param("who"), Some("first"));
        assert_eq!(second.input.param("who"), Some("second"));
        assert!(!second.response.started());

        drop(first);
        let third = pool.acquire(parts(Method::GET, "/c"), None);
        assert!(third.input.params().is_empty());
        assert!(!third.response.started());
        assert_eq!(third.input.path(), "/c");
    }
    assert_eq!(pool.stats().created, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_release() {
    let pool = Arc::new(ContextPool::new(16, services()));

    let mut tasks = Vec::new();
    for worker in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..125 {
                let uri = format!("/w/{worker}/{i}");
                let mut ctx = pool.acquire(parts(Method::GET, &uri), None);
                assert!(ctx.input.params().is_empty());
                assert!(ctx.input.data("worker").is_none());
                assert!(!ctx.response.started());
                assert_eq!(ctx.input.path(), uri);

                ctx.input.set_param("worker", worker.to_string());
                ctx.input.set_data("worker", worker);
                ctx.write("x");
                drop(ctx);
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert!(pool.stats().idle <= 16);
}

/// One thing a request can do to its context
#[derive(Debug, Clone)]
enum Write {
    Param(String, String),
    Data(String, i64),
    Body(Vec<u8>),
    Status(u16),
    Header(String, String),
    Chunk(Vec<u8>),
    WriteHeader(u16),
    Stream,
    Flash(String, String),
    Template(String),
    Layout(String),
    Section(String, String),
    ViewData(String, i64),
    Names(String, String),
    Xsrf,
}

fn write_strategy() -> impl Strategy<Value = Write> {
    let key = "[a-z]{1,8}";
    let value = "[a-zA-Z0-9 ]{0,16}";
    let input = prop_oneof![
        (key, value).prop_map(|(k, v)| Write::Param(k, v)),
        (key, any::<i64>()).prop_map(|(k, v)| Write::Data(k, v)),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Write::Body),
        Just(Write::Xsrf),
    ];
    let output = prop_oneof![
        (200u16..600).prop_map(Write::Status),
        ("x-[a-z]{1,8}", "[a-z0-9]{1,8}").prop_map(|(k, v)| Write::Header(k, v)),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Write::Chunk),
        (200u16..600).prop_map(Write::WriteHeader),
        Just(Write::Stream),
    ];
    let view = prop_oneof![
        (key, value).prop_map(|(k, v)| Write::Flash(k, v)),
        "[a-z]{1,8}\\.tpl".prop_map(Write::Template),
        "[a-z]{1,8}\\.tpl".prop_map(Write::Layout),
        (key, value).prop_map(|(k, v)| Write::Section(k, v)),
        (key, any::<i64>()).prop_map(|(k, v)| Write::ViewData(k, v)),
        (key, key).prop_map(|(c, a)| Write::Names(c, a)),
    ];
    prop_oneof![input, output, view]
}

fn apply(ctx: &mut RequestContext, write: Write) {
    match write {
        Write::Param(k, v) => ctx.input.set_param(k, v),
        Write::Data(k, v) => ctx.input.set_data(k, v),
        Write::Body(bytes) => ctx.input.set_body(bytes.into()),
        Write::Status(code) => {
            if let Ok(status) = StatusCode::from_u16(code) {
                ctx.output.set_status(status);
            }
        }
        Write::Header(k, v) => {
            let _ = ctx.output.header(&k, &v);
        }
        Write::Chunk(bytes) => ctx.write(bytes),
        Write::WriteHeader(code) => {
            if let Ok(status) = StatusCode::from_u16(code) {
                ctx.write_header(status);
            }
        }
        Write::Stream => ctx.stream(StatusCode::OK, AxumBody::from("streamed")),
        Write::Flash(k, v) => ctx.flash(&k, v),
        Write::Template(t) => ctx.view.template = Some(t),
        Write::Layout(l) => ctx.view.layout = Some(l),
        Write::Section(k, v) => {
            ctx.view.sections.insert(k, v);
        }
        Write::ViewData(k, v) => {
            ctx.view.data.insert(k, v.into());
        }
        Write::Names(c, a) => {
            ctx.view.controller_name = c;
            ctx.view.action_name = a;
        }
        Write::Xsrf => {
            ctx.xsrf_token();
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn recycled_context_matches_fresh(
        writes in prop::collection::vec(write_strategy(), 0..32),
        uri in "/[a-z]{0,8}(\\?[a-z]{1,4}=[a-z0-9]{0,4})?",
    ) {
        let services = services();
        let pool = ContextPool::new(1, services.clone());

        {
            let mut used = pool.acquire(parts(Method::POST, "/previous?x=1"), None);
            for write in writes {
                apply(&mut used, write);
            }
        }
        prop_assert_eq!(pool.stats().idle, 1);

        let recycled = pool.acquire(parts(Method::GET, &uri), None);
        let mut fresh = RequestContext::new(services);
        fresh.reset(parts(Method::GET, &uri), None);

        prop_assert_eq!(recycled.snapshot(), fresh.snapshot());
        prop_assert_eq!(pool.stats().created, 1);
    }
}
