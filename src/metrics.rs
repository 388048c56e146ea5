use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Gauge of cloud instances found per machine, set by every provider's
/// `set_metrics_for_machines` sweep. Scrape wiring lives outside the engine;
/// this is only the collection point.
pub static INSTANCES_FOR_MACHINE: Lazy<Gauge> = Lazy::new(|| Gauge::new("instances_for_machine"));

pub struct Gauge {
    name: &'static str,
    series: Mutex<HashMap<String, f64>>,
}

impl Gauge {
    pub fn new(name: &'static str) -> Self {
        Gauge {
            name,
            series: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set(&self, machine_name: &str, value: f64) {
        self.series.lock().unwrap().insert(machine_name.to_string(), value);
    }

    pub fn get(&self, machine_name: &str) -> Option<f64> {
        self.series.lock().unwrap().get(machine_name).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.series.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.series.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_set_and_snapshot() {
        // setup:
        let gauge = Gauge::new("instances_for_machine");

        // execute:
        gauge.set("node-1", 1.0);
        gauge.set("node-2", 2.0);
        gauge.set("node-1", 0.0);

        // verify:
        assert_eq!(gauge.get("node-1"), Some(0.0));
        assert_eq!(gauge.snapshot().len(), 2);

        gauge.clear();
        assert!(gauge.snapshot().is_empty());
    }
}
