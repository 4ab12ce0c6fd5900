use lazy_static::lazy_static;
use prometheus::{Gauge, IntCounter, Registry, TextEncoder};

lazy_static! {
    pub static ref STREAMING: Gauge = Gauge::new("streaming", "1 while the broadcast is live").unwrap();
    pub static ref OWNER_LIVE: Gauge =
        Gauge::new("owner_live", "1 while an owner session is open").unwrap();
    pub static ref DOWNTIME_EVENTS: IntCounter =
        IntCounter::new("downtime_events", "downtime events opened").unwrap();
    pub static ref RECOVERIES: IntCounter =
        IntCounter::new("recoveries", "downtime events closed by automatic recovery").unwrap();
    pub static ref BUDGET_OVERRUNS: IntCounter = IntCounter::new(
        "budget_overruns",
        "scene switches confirmed after their time budget"
    )
    .unwrap();
    pub static ref REGISTRY: Registry =
        Registry::new_custom(Some("liveward".to_string()), None).unwrap();
    pub static ref ENCODER: TextEncoder = TextEncoder::new();
}

pub fn register() {
    let _ = REGISTRY.register(Box::new(STREAMING.clone()));
    let _ = REGISTRY.register(Box::new(OWNER_LIVE.clone()));
    let _ = REGISTRY.register(Box::new(DOWNTIME_EVENTS.clone()));
    let _ = REGISTRY.register(Box::new(RECOVERIES.clone()));
    let _ = REGISTRY.register(Box::new(BUDGET_OVERRUNS.clone()));
}
