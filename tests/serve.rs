//! End-to-end tests: a real server on a loopback port, driven with the
//! generated gRPC client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, watch, Mutex};

use hemmer_provider_puppetca::generated::provider_client::ProviderClient;
use hemmer_provider_puppetca::generated::{
    ConfigureRequest, CreateRequest, GetMetadataRequest, GetSchemaRequest, StopRequest,
};
use hemmer_provider_puppetca::schema::{Attribute, Schema};
use hemmer_provider_puppetca::types::MAGIC_COOKIE_VALUE;
use hemmer_provider_puppetca::{
    new_factory, provider_address, serve, serve_with_shutdown, DebuggerAttach, Provider,
    ProviderError, Registry, Resource, ResourceRegistry, ServeError, ServeOptions, ServeState,
    PROVIDER_NAME,
};

struct Certificate {
    provider: Arc<Provider>,
}

#[async_trait::async_trait]
impl Resource for Certificate {
    fn type_name(&self, provider_type_name: &str) -> String {
        format!("{}_certificate", provider_type_name)
    }

    fn schema(&self) -> Schema {
        Schema::v0().with_attribute("name", Attribute::required_string().with_force_new())
    }

    async fn create(&self, planned_state: Value) -> Result<Value, ProviderError> {
        let config = self.provider.config().await.unwrap_or(Value::Null);
        let mut state = planned_state;
        state["url"] = config["url"].clone();
        Ok(state)
    }

    async fn read(&self, current_state: Value) -> Result<Value, ProviderError> {
        Ok(current_state)
    }

    async fn update(&self, _prior: Value, planned: Value) -> Result<Value, ProviderError> {
        Ok(planned)
    }

    async fn delete(&self, _current_state: Value) -> Result<(), ProviderError> {
        Ok(())
    }
}

fn new_certificate(provider: Arc<Provider>) -> Box<dyn Resource> {
    Box::new(Certificate { provider })
}

fn options() -> ServeOptions {
    ServeOptions::new(provider_address(PROVIDER_NAME))
        .with_magic_cookie(Some(MAGIC_COOKIE_VALUE.to_string()))
        .with_shutdown_timeout(Duration::from_secs(2))
}

async fn serving_addr(state: &mut watch::Receiver<ServeState>) -> SocketAddr {
    let current = *state
        .wait_for(|s| matches!(s, ServeState::Serving(_)))
        .await
        .expect("server terminated before serving");
    match current {
        ServeState::Serving(addr) => addr,
        other => unreachable!("unexpected state {other:?}"),
    }
}

async fn client(addr: SocketAddr) -> ProviderClient<tonic::transport::Channel> {
    ProviderClient::connect(format!("http://{}", addr))
        .await
        .expect("connect to provider")
}

#[tokio::test]
async fn test_empty_registries_serve_empty_schema_until_stop() {
    let factory = new_factory(PROVIDER_NAME, "test", Registry::empty(), Registry::empty());
    let (state_tx, mut state_rx) = watch::channel(ServeState::Initializing);
    let server = tokio::spawn(serve(factory, options().with_state_sender(state_tx)));

    let addr = serving_addr(&mut state_rx).await;
    assert!(addr.ip().is_loopback());
    let mut client = client(addr).await;

    let metadata = client
        .get_metadata(GetMetadataRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(metadata.resources.is_empty());
    assert!(metadata.data_sources.is_empty());
    assert!(metadata.diagnostics.is_empty());

    let schema = client
        .get_schema(GetSchemaRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(schema.resources.is_empty());
    assert!(schema.data_sources.is_empty());
    assert!(schema.diagnostics.is_empty());

    let stop = client.stop(StopRequest {}).await.unwrap().into_inner();
    assert!(stop.error.is_empty());
    drop(client);

    let result = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("server did not shut down")
        .unwrap();
    tokio_test::assert_ok!(result);
    assert_eq!(*state_rx.borrow(), ServeState::Terminated);
}

#[tokio::test]
async fn test_registered_resource_over_grpc() {
    let factory = new_factory(
        PROVIDER_NAME,
        "test",
        Registry::empty(),
        ResourceRegistry::builder().register(new_certificate).build(),
    );
    let (state_tx, mut state_rx) = watch::channel(ServeState::Initializing);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve_with_shutdown(
        factory,
        options().with_state_sender(state_tx),
        async {
            let _ = shutdown_rx.await;
        },
    ));

    let mut client = client(serving_addr(&mut state_rx).await).await;

    let metadata = client
        .get_metadata(GetMetadataRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(metadata.resources, vec!["puppetca_certificate"]);

    let schema = client
        .get_schema(GetSchemaRequest {})
        .await
        .unwrap()
        .into_inner();
    let block = schema.resources["puppetca_certificate"]
        .block
        .as_ref()
        .unwrap();
    assert!(block.attributes.iter().any(|a| a.name == "name"));

    let configure = client
        .configure(ConfigureRequest {
            config: serde_json::to_vec(&json!({"url": "https://puppet:8140"})).unwrap(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(configure.diagnostics.is_empty());

    let created = client
        .create(CreateRequest {
            resource_type: "puppetca_certificate".to_string(),
            planned_state: serde_json::to_vec(&json!({"name": "node1"})).unwrap(),
        })
        .await
        .unwrap()
        .into_inner();
    assert!(created.diagnostics.is_empty());
    let state: Value = serde_json::from_slice(&created.state).unwrap();
    assert_eq!(state, json!({"name": "node1", "url": "https://puppet:8140"}));

    let unknown = client
        .create(CreateRequest {
            resource_type: "puppetca_widget".to_string(),
            planned_state: b"{}".to_vec(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(unknown.diagnostics.len(), 1);
    assert!(unknown.diagnostics[0].summary.contains("puppetca_widget"));

    drop(client);
    shutdown_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("server did not shut down")
        .unwrap();
    assert!(result.is_ok());
}

/// Blocks until the test releases it.
struct GatedDebugger {
    release: Mutex<Option<oneshot::Receiver<()>>>,
    waited: AtomicUsize,
}

#[async_trait::async_trait]
impl DebuggerAttach for GatedDebugger {
    async fn wait_for_attach(&self) -> Result<(), ServeError> {
        self.waited.fetch_add(1, Ordering::SeqCst);
        let release = self.release.lock().await.take();
        if let Some(release) = release {
            release
                .await
                .map_err(|_| ServeError::Debugger("gate dropped".to_string()))?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_debug_mode_waits_for_debugger_before_serving() {
    static BUILT: AtomicUsize = AtomicUsize::new(0);

    fn counting(provider: Arc<Provider>) -> Box<dyn Resource> {
        BUILT.fetch_add(1, Ordering::SeqCst);
        Box::new(Certificate { provider })
    }

    let (release_tx, release_rx) = oneshot::channel();
    let debugger = Arc::new(GatedDebugger {
        release: Mutex::new(Some(release_rx)),
        waited: AtomicUsize::new(0),
    });

    let factory = new_factory(
        PROVIDER_NAME,
        "test",
        Registry::empty(),
        ResourceRegistry::builder().register(counting).build(),
    );
    let (state_tx, mut state_rx) = watch::channel(ServeState::Initializing);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let options = options()
        .with_debug(true)
        .with_magic_cookie(None)
        .with_debugger(debugger.clone())
        .with_state_sender(state_tx);
    let server = tokio::spawn(serve_with_shutdown(factory, options, async {
        let _ = shutdown_rx.await;
    }));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(debugger.waited.load(Ordering::SeqCst), 1);
    assert_eq!(*state_rx.borrow(), ServeState::Initializing);
    assert_eq!(BUILT.load(Ordering::SeqCst), 0);

    release_tx.send(()).unwrap();
    let mut client = client(serving_addr(&mut state_rx).await).await;
    let metadata = client
        .get_metadata(GetMetadataRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(metadata.resources, vec!["puppetca_certificate"]);
    assert!(BUILT.load(Ordering::SeqCst) >= 1);

    drop(client);
    shutdown_tx.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("server did not shut down")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_bind_failure_is_fatal_and_builds_nothing() {
    static BUILT: AtomicUsize = AtomicUsize::new(0);

    fn counting(provider: Arc<Provider>) -> Box<dyn Resource> {
        BUILT.fetch_add(1, Ordering::SeqCst);
        Box::new(Certificate { provider })
    }

    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let factory = new_factory(
        PROVIDER_NAME,
        "test",
        Registry::empty(),
        ResourceRegistry::builder().register(counting).build(),
    );
    let (state_tx, state_rx) = watch::channel(ServeState::Initializing);
    let options = options().with_listen_addr(addr).with_state_sender(state_tx);

    let err = serve(factory, options).await.unwrap_err();
    match err {
        ServeError::Bind { addr: failed, .. } => assert_eq!(failed, addr),
        other => panic!("expected bind error, got {other}"),
    }
    assert_eq!(BUILT.load(Ordering::SeqCst), 0);
    assert_eq!(*state_rx.borrow(), ServeState::Terminated);
}

#[tokio::test]
async fn test_refuses_to_serve_without_magic_cookie() {
    let factory = new_factory(PROVIDER_NAME, "test", Registry::empty(), Registry::empty());
    let err = serve(factory, options().with_magic_cookie(None))
        .await
        .unwrap_err();
    assert!(matches!(err, ServeError::NotLaunchedByHost));
    assert!(err.to_string().contains("plugin"));
}
