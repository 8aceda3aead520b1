//! Process-local labeled counters.
//!
//! A full metrics pipeline is out of scope; operators read these through the
//! RPC stats surface.

use std::collections::BTreeMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

static REGISTRY: Lazy<Mutex<BTreeMap<String, u64>>> = Lazy::new(|| Mutex::new(BTreeMap::new()));

/// Increment `name{labels}` by one. Labels must be pre-rendered
/// `key="value"` pairs in stable order.
pub fn inc(name: &str, labels: &[(&str, &str)]) {
    inc_by(name, labels, 1);
}

pub fn inc_by(name: &str, labels: &[(&str, &str)], delta: u64) {
    let key = render_key(name, labels);
    let mut reg = REGISTRY.lock().expect("metrics registry poisoned");
    *reg.entry(key).or_insert(0) += delta;
}

/// Point-in-time copy of every counter.
pub fn snapshot() -> BTreeMap<String, u64> {
    REGISTRY.lock().expect("metrics registry poisoned").clone()
}

/// Counter for the kernel's accepted transitions.
pub fn record_transition(from: &str, to: &str, provider: &str) {
    inc(
        "transitions_total",
        &[("from", from), ("to", to), ("provider", provider)],
    );
}

fn render_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    format!("{}{{{}}}", name, rendered.join(","))
}
