use std::{
    collections::BTreeMap,
    net::SocketAddr,
    time::{Duration, Instant},
    };
use log::*;


/**
    endpoints receiving the frames observed on the bus

    endpoints refreshed by their own activity expire once idle for longer than the timeout, static endpoints never expire.
*/
#[derive(Clone, Debug)]
pub struct Targets {
    timeout: Duration,
    entries: BTreeMap<SocketAddr, Target>,
}
#[derive(Copy, Clone, Debug)]
struct Target {
    last_seen: Instant,
    permanent: bool,
}

impl Targets {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: BTreeMap::new(),
        }
    }
    pub fn timeout(&self) -> Duration  {self.timeout}

    /// add an endpoint that never expires
    pub fn add_static(&mut self, endpoint: SocketAddr) {
        debug!("static target {}", endpoint);
        self.entries.insert(endpoint, Target {
            last_seen: Instant::now(),
            permanent: true,
            });
    }
    /// insert the endpoint or mark it seen now
    pub fn refresh(&mut self, endpoint: SocketAddr) {
        self.refresh_at(endpoint, Instant::now())
    }
    pub fn refresh_at(&mut self, endpoint: SocketAddr, now: Instant) {
        self.entries.entry(endpoint)
            .and_modify(|target| target.last_seen = now)
            .or_insert_with(|| {
                info!("new target {}", endpoint);
                Target {last_seen: now, permanent: false}
            });
    }
    pub fn remove(&mut self, endpoint: SocketAddr) -> bool {
        self.entries.remove(&endpoint).is_some()
    }

    /// drop expired endpoints
    pub fn sweep(&mut self) {
        self.sweep_at(Instant::now())
    }
    pub fn sweep_at(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.entries.retain(|endpoint, target| {
            if target.permanent {
                target.last_seen = now;
                return true;
            }
            let alive = now.saturating_duration_since(target.last_seen) <= timeout;
            if !alive {
                info!("target {} expired", endpoint);
            }
            alive
        });
    }

    pub fn contains(&self, endpoint: SocketAddr) -> bool {
        self.entries.contains_key(&endpoint)
    }
    pub fn iter(&self) -> impl Iterator<Item=SocketAddr> + '_ {
        self.entries.keys().copied()
    }
    pub fn len(&self) -> usize  {self.entries.len()}
    pub fn is_empty(&self) -> bool  {self.entries.is_empty()}
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 10], port))
    }

    #[test]
    fn expire_idle_targets() {
        let start = Instant::now();
        let mut targets = Targets::new(Duration::from_secs(10));
        targets.refresh_at(endpoint(1000), start);
        targets.refresh_at(endpoint(2000), start);
        assert_eq!(targets.len(), 2);

        targets.refresh_at(endpoint(2000), start + Duration::from_secs(8));
        targets.sweep_at(start + Duration::from_secs(10));
        assert_eq!(targets.len(), 2);

        targets.sweep_at(start + Duration::from_secs(15));
        assert_eq!(targets.iter().collect::<Vec<_>>(), [endpoint(2000)]);

        targets.sweep_at(start + Duration::from_secs(19));
        assert!(targets.is_empty());
    }

    #[test]
    fn static_targets_stay() {
        let mut targets = Targets::new(Duration::from_secs(1));
        targets.add_static(endpoint(9999));
        let later = Instant::now() + Duration::from_secs(3600);
        targets.sweep_at(later);
        targets.sweep_at(later + Duration::from_secs(3600));
        assert!(targets.contains(endpoint(9999)));

        assert!(targets.remove(endpoint(9999)));
        assert!(!targets.remove(endpoint(9999)));
    }
}
