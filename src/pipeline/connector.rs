use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::ingest::{SourceFactory, SourceTimeouts, VideoSource};

/// Owns the upstream source handle.
///
/// Every operation that opens, reads, releases, or inspects the handle goes
/// through one mutex, so a restart racing a read never sees a half-released
/// source.
pub struct StreamConnector {
    factory: SourceFactory,
    timeouts: SourceTimeouts,
    handle: Mutex<Option<Box<dyn VideoSource>>>,
}

impl StreamConnector {
    pub fn new(factory: SourceFactory, timeouts: SourceTimeouts) -> Self {
        Self {
            factory,
            timeouts,
            handle: Mutex::new(None),
        }
    }

    /// Open a fresh source and prove it live with one read.
    ///
    /// On failure the handle is released before returning, so the next
    /// attempt starts clean.
    pub fn connect(&self) -> bool {
        let mut handle = self.lock();
        release_locked(&mut handle);

        let mut source = match (self.factory)() {
            Ok(source) => source,
            Err(err) => {
                log::error!("capture: cannot create source: {:#}", err);
                return false;
            }
        };
        let target = source.describe();
        log::info!("capture: connecting to {}", target);

        if let Err(err) = source.open(&self.timeouts) {
            log::error!("capture: failed to open {}: {:#}", target, err);
            source.close();
            return false;
        }
        if let Err(err) = source.read() {
            log::error!("capture: {} opened but produced no frame: {:#}", target, err);
            source.close();
            return false;
        }

        log::info!("capture: connected to {}", target);
        *handle = Some(source);
        true
    }

    pub fn read(&self) -> Result<RgbImage> {
        let mut handle = self.lock();
        match handle.as_mut() {
            Some(source) => source.read(),
            None => Err(anyhow!("stream is not connected")),
        }
    }

    /// Drop the handle if any. Safe from any state.
    pub fn release(&self) {
        let mut handle = self.lock();
        release_locked(&mut handle);
    }

    pub fn is_open(&self) -> bool {
        self.lock().as_ref().is_some_and(|source| source.is_open())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn VideoSource>>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn release_locked(handle: &mut Option<Box<dyn VideoSource>>) {
    if let Some(mut source) = handle.take() {
        source.close();
        log::info!("capture: released {}", source.describe());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeSource {
        open: bool,
        fail_open: bool,
        closes: Arc<AtomicUsize>,
    }

    impl VideoSource for FakeSource {
        fn open(&mut self, _timeouts: &SourceTimeouts) -> Result<()> {
            if self.fail_open {
                return Err(anyhow!("refused"));
            }
            self.open = true;
            Ok(())
        }

        fn read(&mut self) -> Result<RgbImage> {
            if self.open {
                Ok(RgbImage::new(4, 4))
            } else {
                Err(anyhow!("closed"))
            }
        }

        fn close(&mut self) {
            self.open = false;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn describe(&self) -> String {
            "fake://".into()
        }
    }

    fn connector(fail_open: bool, closes: Arc<AtomicUsize>) -> StreamConnector {
        StreamConnector::new(
            Box::new(move || {
                Ok(Box::new(FakeSource {
                    open: false,
                    fail_open,
                    closes: closes.clone(),
                }) as Box<dyn VideoSource>)
            }),
            SourceTimeouts::default(),
        )
    }

    #[test]
    fn failed_connect_releases_handle() {
        let closes = Arc::new(AtomicUsize::new(0));
        let conn = connector(true, closes.clone());
        assert!(!conn.connect());
        assert!(!conn.is_open());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(conn.read().is_err());
    }

    #[test]
    fn reconnect_replaces_old_handle_and_release_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let conn = connector(false, closes.clone());
        assert!(conn.connect());
        assert!(conn.read().is_ok());
        assert!(conn.connect());
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        conn.release();
        conn.release();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(!conn.is_open());
    }
}
