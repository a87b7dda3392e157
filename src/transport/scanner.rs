//! Bounded, deduplicated device discovery

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use meshlink_shared::{classify, BleError, DeviceIdentity, Uuid};
use regex::Regex;
use tracing::{debug, info, warn};

use crate::transport::traits::{Advertisement, Central};

/// Constraints an advertisement must satisfy to be reported
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    /// Advertised services; a device matches if it advertises any of them
    pub service_uuids: Vec<Uuid>,
    /// Pattern the advertised name must match
    pub name_pattern: Option<Regex>,
}

impl ScanFilter {
    /// Report every visible device
    pub fn any() -> Self {
        Self::default()
    }

    /// Report devices advertising the given service
    pub fn service(uuid: Uuid) -> Self {
        Self {
            service_uuids: vec![uuid],
            name_pattern: None,
        }
    }

    pub fn with_name_pattern(mut self, pattern: Regex) -> Self {
        self.name_pattern = Some(pattern);
        self
    }

    /// Check an advertisement against every configured constraint
    pub fn matches<P>(&self, advert: &Advertisement<P>) -> bool {
        if !self.service_uuids.is_empty()
            && !advert
                .service_uuids
                .iter()
                .any(|uuid| self.service_uuids.contains(uuid))
        {
            return false;
        }

        match &self.name_pattern {
            Some(pattern) => advert
                .device
                .name
                .as_deref()
                .is_some_and(|name| pattern.is_match(name)),
            None => true,
        }
    }
}

/// Turns raw platform discovery into finite scans
pub struct Scanner<C> {
    central: Arc<C>,
}

impl<C> Clone for Scanner<C> {
    fn clone(&self) -> Self {
        Self {
            central: Arc::clone(&self.central),
        }
    }
}

impl<C: Central> Scanner<C> {
    pub fn new(central: Arc<C>) -> Self {
        Self { central }
    }

    /// Scan for `timeout`, yielding each matching address once.
    ///
    /// Nothing happens until the stream is first polled. The platform scan is
    /// stopped when the stream ends or is dropped. A failure to start the scan
    /// is yielded once as an error and ends the stream.
    pub fn scan(
        &self,
        timeout: Duration,
        filter: Option<ScanFilter>,
    ) -> BoxStream<'static, Result<DeviceIdentity<C::Peripheral>, BleError>> {
        let central = Arc::clone(&self.central);
        let filter = filter.unwrap_or_default();

        let results = stream::once(async move {
            match central.scan(&filter).await {
                Ok(adverts) => {
                    info!("[SCAN] Scanning for {:?}", timeout);
                    adverts
                        .filter(move |advert| future::ready(filter.matches(advert)))
                        .map(|advert| Ok(advert.device))
                        .boxed()
                }
                Err(fault) => {
                    let err = classify(fault);
                    warn!("[SCAN] Failed to start scan: {}", err);
                    stream::once(future::ready(Err(err))).boxed()
                }
            }
        })
        .flatten();

        let mut seen = HashSet::new();
        results
            .filter(move |result| {
                let first_seen = match result {
                    Ok(device) => {
                        let fresh = seen.insert(device.address.clone());
                        if fresh {
                            debug!("[SCAN] Found {}", device);
                        }
                        fresh
                    }
                    Err(_) => true,
                };
                future::ready(first_seen)
            })
            // The deadline starts on first poll, like the scan itself
            .take_until(async move { tokio::time::sleep(timeout).await })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{FakeCentral, FakePeripheral};
    use meshlink_shared::profile::{name_regex, SERVICE_UUID};
    use tokio::time::Instant;

    fn device(name: &str, address: &str) -> DeviceIdentity<FakePeripheral> {
        FakePeripheral::new().identity(Some(name), address)
    }

    fn addresses(devices: &[Result<DeviceIdentity<FakePeripheral>, BleError>]) -> Vec<String> {
        devices
            .iter()
            .map(|d| d.as_ref().map(|d| d.address.clone()).unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_filter_matches() {
        let advert = Advertisement {
            device: device("Meshtastic_1A2B", "AA:BB:CC:DD:EE:01"),
            service_uuids: vec![SERVICE_UUID],
            rssi: None,
        };

        assert!(ScanFilter::any().matches(&advert));
        assert!(ScanFilter::service(SERVICE_UUID).matches(&advert));
        assert!(!ScanFilter::service(Uuid::nil()).matches(&advert));
        assert!(ScanFilter::service(SERVICE_UUID)
            .with_name_pattern(name_regex().clone())
            .matches(&advert));

        let unnamed = Advertisement {
            device: FakePeripheral::new().identity(None, "AA:BB:CC:DD:EE:02"),
            service_uuids: vec![SERVICE_UUID],
            rssi: None,
        };
        assert!(!ScanFilter::any()
            .with_name_pattern(name_regex().clone())
            .matches(&unnamed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_dedups_in_first_seen_order() {
        let central = Arc::new(FakeCentral::new());
        let a = device("Radio_AAAA", "AA:BB:CC:DD:EE:01");
        let b = device("Radio_BBBB", "AA:BB:CC:DD:EE:02");
        central.advertise(Duration::from_millis(100), a.clone(), vec![]);
        central.advertise(Duration::from_millis(100), a.clone(), vec![]);
        central.advertise(Duration::from_millis(100), b.clone(), vec![]);
        central.advertise(Duration::from_millis(100), a, vec![]);

        let scanner = Scanner::new(Arc::clone(&central));
        let found: Vec<_> = scanner.scan(Duration::from_secs(5), None).collect().await;

        assert_eq!(addresses(&found), vec!["AA:BB:CC:DD:EE:01", "AA:BB:CC:DD:EE:02"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_applies_filter() {
        let central = Arc::new(FakeCentral::new());
        central.advertise(Duration::from_millis(10), device("Other", "AA:BB:CC:DD:EE:01"), vec![]);
        central.advertise(
            Duration::from_millis(10),
            device("Radio_BBBB", "AA:BB:CC:DD:EE:02"),
            vec![SERVICE_UUID],
        );

        let scanner = Scanner::new(Arc::clone(&central));
        let found: Vec<_> = scanner
            .scan(Duration::from_secs(1), Some(ScanFilter::service(SERVICE_UUID)))
            .collect()
            .await;

        assert_eq!(addresses(&found), vec!["AA:BB:CC:DD:EE:02"]);
        let sent = central.last_filter().unwrap();
        assert_eq!(sent.service_uuids, vec![SERVICE_UUID]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_ends_at_timeout() {
        let central = Arc::new(FakeCentral::new());
        central.advertise(Duration::from_secs(1), device("Early_0001", "AA:BB:CC:DD:EE:01"), vec![]);
        central.advertise(Duration::from_secs(10), device("Late_0002", "AA:BB:CC:DD:EE:02"), vec![]);

        let scanner = Scanner::new(Arc::clone(&central));
        let start = Instant::now();
        let found: Vec<_> = scanner.scan(Duration::from_secs(5), None).collect().await;

        assert_eq!(addresses(&found), vec!["AA:BB:CC:DD:EE:01"]);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(central.active_scans(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_is_lazy() {
        let central = Arc::new(FakeCentral::new());
        let scanner = Scanner::new(Arc::clone(&central));

        let stream = scanner.scan(Duration::from_secs(5), None);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(central.scan_calls(), 0);

        // The timeout counts from the first poll, not from creation
        central.advertise(Duration::from_secs(1), device("Radio_0001", "AA:BB:CC:DD:EE:01"), vec![]);
        let found: Vec<_> = stream.collect().await;
        assert_eq!(found.len(), 1);
        assert_eq!(central.scan_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_start_failure() {
        let central = Arc::new(FakeCentral::new());
        central.fail_next_scan("adapter busy");

        let scanner = Scanner::new(Arc::clone(&central));
        let found: Vec<_> = scanner.scan(Duration::from_secs(5), None).collect().await;

        assert_eq!(found.len(), 1);
        let err = found[0].as_ref().unwrap_err();
        assert!(matches!(err, BleError::Scanning(_)));
        assert!(err.should_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_stream_stops_platform_scan() {
        let central = Arc::new(FakeCentral::new());
        central.advertise(Duration::from_millis(10), device("Radio_0001", "AA:BB:CC:DD:EE:01"), vec![]);

        let scanner = Scanner::new(Arc::clone(&central));
        let mut stream = scanner.scan(Duration::from_secs(5), None);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.address, "AA:BB:CC:DD:EE:01");
        assert_eq!(central.active_scans(), 1);

        drop(stream);
        assert_eq!(central.active_scans(), 0);
    }
}
