use std::{fmt, pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};

use crate::transform::PayloadError;

/// Delivery acknowledgement for one message.
///
/// [`Ack::ack`] tells the source the message is finished with. Dropping an
/// `Ack` without calling it leaves the message unacknowledged, so the source
/// may deliver it again.
#[derive(Default)]
pub struct Ack(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Ack {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn ack(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "Ack(pending)" } else { "Ack(none)" })
    }
}

#[derive(Debug)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
    pub ack: Ack,
}

impl<T> Envelope<T> {
    pub fn new(payload: T, received_at: SystemTime) -> Self {
        Self {
            payload,
            received_at,
            ack: Ack::default(),
        }
    }

    pub fn with_ack(mut self, ack: Ack) -> Self {
        self.ack = ack;
        self
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("payload error: {0}")]
    Decode(#[from] PayloadError),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    /// Consume the stream. Each `Ok` envelope must be acked once the sink is
    /// done with it, whether or not it was stored.
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

/// Source of raw `R` messages, decoded once into `T`, then passed through any
/// number of same-type transforms before reaching the sink.
///
/// A message rejected by the decoder or a transform is acked here; accepted
/// messages carry their ack through to the sink.
pub struct Pipeline<S, R, T, K> {
    pub source: S,
    pub decoder: Arc<dyn Transform<R, T> + Send + Sync>,
    pub transforms: Vec<Arc<dyn Transform<T, T> + Send + Sync>>,
    pub sink: K,
}

async fn apply_stage<I, O>(
    stage: &(dyn Transform<I, O> + Send + Sync),
    item: Result<Envelope<I>, PipelineError>,
) -> Result<Envelope<O>, PipelineError>
where
    I: Send,
{
    let mut env = item?;
    let ack = std::mem::take(&mut env.ack);
    match stage.apply(env).await {
        Ok(out) => Ok(out.with_ack(ack)),
        Err(e) => {
            ack.ack();
            Err(e)
        }
    }
}

impl<S, R, T, K> Pipeline<S, R, T, K>
where
    R: Send + 'static,
    T: Send + 'static,
    S: Source<R> + Send + Sync + 'static,
    K: Sink<T> + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<(), PipelineError> {
        let raw = self.source.stream().await;

        let decoder = self.decoder.clone();
        let mut stream: EnvelopeStream<T> = Box::pin(raw.then(move |item| {
            let decoder = decoder.clone();
            async move { apply_stage(decoder.as_ref(), item).await }
        }));

        // Apply transforms in sequence (if any).
        for t in self.transforms {
            let t_arc = t.clone();
            stream = Box::pin(stream.then(move |item| {
                let t_inner = t_arc.clone();
                async move { apply_stage(t_inner.as_ref(), item).await }
            }));
        }

        self.sink.run(stream).await
    }
}
