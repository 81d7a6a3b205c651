use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::remote::datastore::{
    box_stream_future, NoopTokenProvider, StreamHandle, StreamingDatastore, StreamingFuture, TokenProviderArc,
};
use crate::remote::stream::{PersistentStream, PersistentStreamDelegate, PersistentStreamHandle, StreamKind};
use crate::util::RetrySettings;

/// Tokens fetched when a stream (re)opens.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

#[derive(Clone)]
struct StreamCredentialProvider {
    auth_provider: TokenProviderArc,
    app_check_provider: TokenProviderArc,
}

impl StreamCredentialProvider {
    async fn fetch(&self) -> FirestoreResult<StreamCredentials> {
        let auth_token = self.auth_provider.get_token().await?;
        let app_check_token = self.app_check_provider.get_token().await?;
        Ok(StreamCredentials {
            auth_token,
            app_check_token,
        })
    }

    fn invalidate(&self) {
        self.auth_provider.invalidate_token();
        self.app_check_provider.invalidate_token();
    }
}

/// Protocol logic of one stream, driven by the network layer.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait NetworkStreamHandler: Send + Sync + 'static {
    fn label(&self) -> &'static str;
    fn should_continue(&self) -> bool;

    async fn on_open(&self, stream: Arc<dyn StreamHandle>, credentials: StreamCredentials) -> FirestoreResult<()>;

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()>;

    async fn on_close(&self);

    async fn on_error(&self, error: FirestoreError);
}

struct NetworkStreamDelegate<H>
where
    H: NetworkStreamHandler,
{
    handler: Arc<H>,
    credentials: StreamCredentialProvider,
}

impl<H> PersistentStreamDelegate for NetworkStreamDelegate<H>
where
    H: NetworkStreamHandler,
{
    fn stream_label(&self) -> &'static str {
        self.handler.label()
    }

    fn on_stream_open(&self, stream: Arc<dyn StreamHandle>) -> StreamingFuture<'_, FirestoreResult<()>> {
        let handler = Arc::clone(&self.handler);
        let credentials = self.credentials.clone();
        box_stream_future(async move {
            let creds = credentials.fetch().await?;
            handler.on_open(stream, creds).await
        })
    }

    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        let handler = Arc::clone(&self.handler);
        box_stream_future(async move { handler.on_message(message).await })
    }

    fn on_stream_close(&self) -> StreamingFuture<'_, ()> {
        let handler = Arc::clone(&self.handler);
        box_stream_future(async move { handler.on_close().await })
    }

    fn on_stream_error(&self, error: FirestoreError) -> StreamingFuture<'_, ()> {
        let handler = Arc::clone(&self.handler);
        let credentials = self.credentials.clone();
        box_stream_future(async move {
            if error.code == FirestoreErrorCode::Unauthenticated {
                log::debug!("{} stream: invalidating credentials after {error}", handler.label());
                credentials.invalidate();
            }
            handler.on_error(error).await;
        })
    }

    fn should_continue(&self) -> bool {
        self.handler.should_continue()
    }
}

/// Starts persistent streams against a datastore with shared credentials
/// and retry policy.
#[derive(Clone)]
pub struct NetworkLayer {
    datastore: Arc<dyn StreamingDatastore>,
    credentials: StreamCredentialProvider,
    retry: RetrySettings,
}

impl NetworkLayer {
    pub fn builder(datastore: Arc<dyn StreamingDatastore>, auth_provider: TokenProviderArc) -> NetworkLayerBuilder {
        NetworkLayerBuilder::new(datastore, auth_provider)
    }

    pub fn listen<H>(&self, handler: Arc<H>) -> PersistentStreamHandle
    where
        H: NetworkStreamHandler,
    {
        self.spawn_stream(handler, StreamKind::Listen)
    }

    pub fn write<H>(&self, handler: Arc<H>) -> PersistentStreamHandle
    where
        H: NetworkStreamHandler,
    {
        self.spawn_stream(handler, StreamKind::Write)
    }

    fn spawn_stream<H>(&self, handler: Arc<H>, kind: StreamKind) -> PersistentStreamHandle
    where
        H: NetworkStreamHandler,
    {
        let delegate = Arc::new(NetworkStreamDelegate {
            handler,
            credentials: self.credentials.clone(),
        });
        PersistentStream::new(Arc::clone(&self.datastore), delegate, self.retry.clone(), kind).start()
    }
}

pub struct NetworkLayerBuilder {
    datastore: Arc<dyn StreamingDatastore>,
    auth_provider: TokenProviderArc,
    app_check_provider: Option<TokenProviderArc>,
    retry: RetrySettings,
}

impl NetworkLayerBuilder {
    fn new(datastore: Arc<dyn StreamingDatastore>, auth_provider: TokenProviderArc) -> Self {
        Self {
            datastore,
            auth_provider,
            app_check_provider: None,
            retry: RetrySettings::default(),
        }
    }

    pub fn with_app_check_provider(mut self, provider: TokenProviderArc) -> Self {
        self.app_check_provider = Some(provider);
        self
    }

    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> NetworkLayer {
        let app_check_provider = self
            .app_check_provider
            .unwrap_or_else(|| Arc::new(NoopTokenProvider) as TokenProviderArc);
        NetworkLayer {
            datastore: self.datastore,
            credentials: StreamCredentialProvider {
                auth_provider: self.auth_provider,
                app_check_provider,
            },
            retry: self.retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::unauthenticated;
    use crate::platform::runtime;
    use crate::remote::datastore::{StreamingDatastoreImpl, TokenProvider};
    use crate::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone)]
    struct TestTokenProvider {
        token: Option<String>,
        invalidated: Arc<AtomicBool>,
    }

    impl TestTokenProvider {
        fn new(token: Option<String>) -> (Self, Arc<AtomicBool>) {
            let invalidated = Arc::new(AtomicBool::new(false));
            (
                Self {
                    token,
                    invalidated: Arc::clone(&invalidated),
                },
                invalidated,
            )
        }
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl TokenProvider for TestTokenProvider {
        async fn get_token(&self) -> FirestoreResult<Option<String>> {
            Ok(self.token.clone())
        }

        fn invalidate_token(&self) {
            self.invalidated.store(true, Ordering::SeqCst);
        }
    }

    struct TestHandler {
        credentials: Mutex<Vec<StreamCredentials>>,
        messages: Mutex<Vec<Vec<u8>>>,
        errors: Mutex<Vec<FirestoreError>>,
        running: AtomicBool,
    }

    impl TestHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                credentials: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                running: AtomicBool::new(true),
            })
        }
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl NetworkStreamHandler for TestHandler {
        fn label(&self) -> &'static str {
            "test-listen"
        }

        fn should_continue(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        async fn on_open(&self, stream: Arc<dyn StreamHandle>, credentials: StreamCredentials) -> FirestoreResult<()> {
            self.credentials.lock().unwrap().push(credentials);
            stream.send(b"handshake".to_vec()).await
        }

        async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
            self.messages.lock().unwrap().push(payload);
            Ok(())
        }

        async fn on_close(&self) {}

        async fn on_error(&self, error: FirestoreError) {
            self.errors.lock().unwrap().push(error);
        }
    }

    #[tokio::test]
    async fn unauthenticated_error_invalidates_credentials() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = Arc::new(MultiplexedConnection::new(left_transport));
        let server = MultiplexedConnection::new(right_transport);
        let datastore: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(client));

        let (auth_provider, auth_invalidated) = TestTokenProvider::new(Some("auth".into()));
        let (app_check_provider, _) = TestTokenProvider::new(Some("app-check".into()));
        let layer = NetworkLayer::builder(datastore, Arc::new(auth_provider) as TokenProviderArc)
            .with_app_check_provider(Arc::new(app_check_provider) as TokenProviderArc)
            .with_retry(RetrySettings::default().with_initial_delay(Duration::from_millis(5)))
            .build();

        let handler = TestHandler::new();
        let handle = layer.listen(Arc::clone(&handler));

        let (_, first) = server.accept_stream().await.expect("first stream");
        let handshake = first.next().await.expect("handshake frame").expect("payload");
        assert_eq!(handshake, b"handshake");
        first.send(b"payload".to_vec()).await.expect("send payload");
        first.fail(unauthenticated("token expired")).await.expect("fail stream");

        let (_, second) = server.accept_stream().await.expect("second stream");
        assert_eq!(second.next().await.expect("handshake").expect("payload"), b"handshake");
        handler.running.store(false, Ordering::SeqCst);
        handle.stop();

        for _ in 0..20 {
            if !handler.errors.lock().unwrap().is_empty() {
                break;
            }
            runtime::sleep(Duration::from_millis(10)).await;
        }
        assert!(auth_invalidated.load(Ordering::SeqCst));
        let credentials = handler.credentials.lock().unwrap();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0].auth_token.as_deref(), Some("auth"));
        assert_eq!(credentials[0].app_check_token.as_deref(), Some("app-check"));
        assert_eq!(handler.messages.lock().unwrap().as_slice(), &[b"payload".to_vec()]);
    }
}
