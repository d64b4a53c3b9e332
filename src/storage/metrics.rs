use log::{info, warn};
use rocksdb::DB;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Background thread that periodically logs `rocksdb.stats` for each
/// physical store.
pub(crate) struct MetricsLogger {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl MetricsLogger {
    pub(crate) fn start(
        path: String,
        dbs: Vec<(&'static str, Arc<DB>)>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("storage-metrics".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                for (column, db) in &dbs {
                    match db.property_value("rocksdb.stats") {
                        Ok(Some(stats)) => {
                            info!("event=storage_metrics path={path} column={column}\n{stats}")
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!("event=storage_metrics_failed path={path} column={column} error={err}")
                        }
                    }
                }
            })?;
        Ok(Self { stop, handle })
    }

    pub(crate) fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("event=storage_metrics_panicked");
        }
    }
}
