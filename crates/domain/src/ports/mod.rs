use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod transport;
pub mod uploads;

pub use transport::{
    Disposer, EnvelopeHandlers, MessagingFetch, MessagingMutations, MessagingSubscriptions,
    SendMessageArgs,
};
pub use uploads::{ProgressSink, UploadSession, UploadStatusPayload, UploadTransport};
