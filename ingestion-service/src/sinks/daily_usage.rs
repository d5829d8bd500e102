use std::{sync::Arc, time::SystemTime};

use futures::StreamExt;
use tokio::sync::mpsc;
use water_client::domain::UsageIncrement;

use crate::pipeline::{Envelope, PipelineError, Sink};
use crate::sinks::connection::{Connector, WorkerConnection};

fn shard_index(key: &str, workers: usize) -> usize {
    use std::hash::{Hash, Hasher};

    let mut h = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut h);
    (h.finish() as usize) % workers.max(1)
}

/// Accumulates every increment into its `daily_usage` row.
///
/// Increments are fanned out to `workers` tasks by device id; each task owns one
/// [`WorkerConnection`]. A failed message is logged and dropped, never retried.
/// Every message is acked only after its write has been attempted.
pub struct DailyUsageSink<C> {
    connector: Arc<C>,
    workers: usize,
    channel_capacity: usize,
}

impl<C: Connector> DailyUsageSink<C> {
    pub fn new(connector: Arc<C>, workers: usize, channel_capacity: usize) -> Self {
        Self {
            connector,
            workers: workers.max(1),
            channel_capacity: channel_capacity.max(1),
        }
    }
}

async fn run_worker<C: Connector>(
    worker: usize,
    connector: Arc<C>,
    mut rx: mpsc::Receiver<Envelope<UsageIncrement>>,
) {
    let mut conn = WorkerConnection::new(worker, connector);

    while let Some(env) = rx.recv().await {
        let inc = &env.payload;
        match conn.accumulate_daily(inc).await {
            Ok(()) => {
                metrics::counter!("store_increments_applied_total").increment(1);
                if let Ok(dur) = SystemTime::now().duration_since(env.received_at) {
                    metrics::histogram!("ingest_end_to_end_latency_seconds").record(dur.as_secs_f64());
                }
                tracing::debug!(
                    worker,
                    device_id = %inc.device_id,
                    usage_date = %inc.usage_date,
                    counter_increase = inc.counter_increase,
                    liters = inc.liters,
                    "accumulated daily usage"
                );
            }
            Err(e) => {
                metrics::counter!("store_errors_total").increment(1);
                tracing::error!(
                    worker,
                    error = %e,
                    device_id = %inc.device_id,
                    usage_date = %inc.usage_date,
                    "failed to accumulate daily usage, dropping message"
                );
            }
        }
        env.ack.ack();
    }

    conn.close().await;
}

#[async_trait::async_trait]
impl<C: Connector> Sink<UsageIncrement> for DailyUsageSink<C> {
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<UsageIncrement>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut txs = Vec::with_capacity(self.workers);
        let mut joins = Vec::with_capacity(self.workers);

        for worker in 0..self.workers {
            let (tx, rx) = mpsc::channel::<Envelope<UsageIncrement>>(self.channel_capacity);
            txs.push(tx);
            joins.push(tokio::spawn(run_worker(worker, self.connector.clone(), rx)));
        }

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping message rejected upstream of DailyUsageSink");
                    continue;
                }
            };

            let idx = shard_index(&env.payload.device_id, self.workers);
            if txs[idx].send(env).await.is_err() {
                return Err(PipelineError::Sink(format!("daily usage worker {idx} stopped")));
            }
        }

        drop(txs);

        for j in joins {
            if let Err(e) = j.await {
                return Err(PipelineError::Sink(format!("daily usage worker join error: {e}")));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use time::macros::date;

    use super::*;
    use crate::pipeline::Ack;
    use crate::sinks::connection::testing::MemoryConnector;
    use crate::transform::PayloadError;

    fn ok(device_id: &str, counter_increase: u32, liters: f64) -> Result<Envelope<UsageIncrement>, PipelineError> {
        Ok(Envelope::new(
            UsageIncrement {
                device_id: device_id.to_string(),
                usage_date: date!(2026 - 02 - 26),
                counter_increase,
                liters,
            },
            SystemTime::now(),
        ))
    }

    async fn drain(
        connector: Arc<MemoryConnector>,
        workers: usize,
        items: Vec<Result<Envelope<UsageIncrement>, PipelineError>>,
    ) {
        let sink = DailyUsageSink::new(connector, workers, 4);
        sink.run(futures::stream::iter(items)).await.expect("sink run");
    }

    #[test]
    fn shard_index_is_stable_and_in_range() {
        for workers in 1..8 {
            let a = shard_index("device-a", workers);
            assert!(a < workers);
            assert_eq!(a, shard_index("device-a", workers));
        }
        assert_eq!(shard_index("anything", 0), 0);
    }

    #[tokio::test]
    async fn upstream_errors_do_not_stop_the_stream() {
        let connector = Arc::new(MemoryConnector::default());
        drain(
            connector.clone(),
            1,
            vec![
                ok("1", 1, 0.5),
                Err(PipelineError::Decode(PayloadError::UnsupportedType("array"))),
                ok("1", 2, 0.25),
            ],
        )
        .await;

        assert_eq!(connector.row("1", date!(2026 - 02 - 26)), Some((3, 0.75)));
    }

    #[tokio::test]
    async fn store_failure_drops_only_that_message() {
        let connector = Arc::new(MemoryConnector::default());
        connector.fail_next.store(true, Ordering::SeqCst);

        drain(connector.clone(), 1, vec![ok("1", 1, 0.5), ok("1", 1, 0.25)]).await;

        assert_eq!(connector.row("1", date!(2026 - 02 - 26)), Some((1, 0.25)));
        let connects = connector.ops().iter().filter(|(_, op)| *op == "connect").count();
        assert_eq!(connects, 2);
    }

    #[tokio::test]
    async fn accumulation_is_order_independent() {
        let forward = Arc::new(MemoryConnector::default());
        drain(forward.clone(), 1, vec![ok("1", 1, 0.5), ok("1", 3, 1.5)]).await;

        let backward = Arc::new(MemoryConnector::default());
        drain(backward.clone(), 1, vec![ok("1", 3, 1.5), ok("1", 1, 0.5)]).await;

        let day = date!(2026 - 02 - 26);
        assert_eq!(forward.row("1", day), backward.row("1", day));
        assert_eq!(forward.row("1", day), Some((4, 2.0)));
    }

    #[tokio::test]
    async fn each_worker_uses_its_own_connection_and_closes_it() {
        let connector = Arc::new(MemoryConnector::default());
        let devices = ["a", "b", "c", "d", "e", "f", "g", "h"];
        let items = devices.iter().map(|d| ok(d, 1, 0.1)).collect();

        drain(connector.clone(), 3, items).await;

        for d in devices {
            assert_eq!(connector.row(d, date!(2026 - 02 - 26)), Some((1, 0.1)));
        }
        let ops = connector.ops();
        let connects = ops.iter().filter(|(_, op)| *op == "connect").count();
        let closes = ops.iter().filter(|(_, op)| *op == "close").count();
        assert!(connects <= 3);
        assert_eq!(connects, closes);
    }

    /// Records the stored row for `device_id` at the moment the message is acked.
    fn acked(
        connector: &Arc<MemoryConnector>,
        seen: &Arc<std::sync::Mutex<Vec<Option<(i64, f64)>>>>,
        item: Result<Envelope<UsageIncrement>, PipelineError>,
    ) -> Result<Envelope<UsageIncrement>, PipelineError> {
        let env = item.expect("envelope");
        let rows = connector.clone();
        let seen = seen.clone();
        let device_id = env.payload.device_id.clone();
        Ok(env.with_ack(Ack::new(move || {
            seen.lock()
                .unwrap()
                .push(rows.row(&device_id, date!(2026 - 02 - 26)));
        })))
    }

    #[tokio::test]
    async fn ack_is_sent_only_after_the_write() {
        let connector = Arc::new(MemoryConnector::default());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        drain(
            connector.clone(),
            1,
            vec![acked(&connector, &seen, ok("1", 1, 0.5)), acked(&connector, &seen, ok("1", 2, 0.25))],
        )
        .await;

        assert_eq!(*seen.lock().unwrap(), vec![Some((1, 0.5)), Some((3, 0.75))]);
    }

    #[tokio::test]
    async fn failed_write_is_still_acked() {
        let connector = Arc::new(MemoryConnector::default());
        connector.fail_next.store(true, Ordering::SeqCst);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        drain(connector.clone(), 1, vec![acked(&connector, &seen, ok("1", 1, 0.5))]).await;

        assert_eq!(*seen.lock().unwrap(), vec![None]);
        assert_eq!(connector.ops().iter().filter(|(_, op)| *op == "fail").count(), 1);
    }
}
