use std::{
    collections::HashMap,
    fmt::Write,
    time::{Duration, Instant},
};

use num_traits::Float;

use crate::{floating_type_mod::FT, spatial_index::SpatialIndex};

#[derive(Clone)]
pub(crate) struct Counter<T> {
    values: Vec<T>,
    last_start: Instant,
}
impl<T> Counter<T> {
    fn new() -> Self {
        Counter::<T> {
            last_start: Instant::now(),
            values: Vec::new(),
        }
    }
    fn add_value(&mut self, v: T) {
        self.values.push(v);
    }
    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }
}
impl Counter<FT> {
    pub(crate) fn avg(&self) -> FT {
        self.values.iter().cloned().sum::<FT>() / self.values.len() as FT
    }
    pub(crate) fn min(&self) -> FT {
        self.values.iter().cloned().fold(FT::max_value(), |a, b| FT::min(a, b))
    }
    pub(crate) fn max(&self) -> FT {
        self.values.iter().cloned().fold(FT::min_value(), |a, b| FT::max(a, b))
    }
    #[cfg(test)]
    pub(crate) fn last(&self) -> Option<FT> {
        self.values.last().cloned()
    }
}
impl Counter<Duration> {
    fn begin(&mut self) {
        self.last_start = Instant::now();
    }

    fn end(&mut self) {
        self.values.push(Instant::now() - self.last_start);
    }

    pub(crate) fn avg(&self) -> Duration {
        if self.values.is_empty() {
            return Duration::ZERO;
        }
        self.sum() / self.values.len() as u32
    }

    pub(crate) fn sum(&self) -> Duration {
        self.values.iter().cloned().sum::<Duration>()
    }
}

pub(crate) struct ValueCounters {
    counters: HashMap<String, Counter<FT>>,
    enabled: bool,
}
impl ValueCounters {
    pub(crate) fn new(enabled: bool) -> ValueCounters {
        ValueCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub(crate) fn add_value(&mut self, id: &str, v: FT) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(|| Counter::<FT>::new())
                .add_value(v);
        }
    }

    #[cfg(test)]
    pub(crate) fn get(&self, id: &str) -> Option<&Counter<FT>> {
        self.counters.get(id)
    }
}

/// Wall-clock time per labelled section. A section that is begun but never ended
/// (because its stage failed) records nothing.
pub(crate) struct PerformanceCounters {
    counters: HashMap<String, Counter<Duration>>,
    enabled: bool,
}
impl PerformanceCounters {
    pub(crate) fn new(enabled: bool) -> PerformanceCounters {
        PerformanceCounters {
            counters: HashMap::default(),
            enabled,
        }
    }

    pub(crate) fn begin(&mut self, id: &str) {
        if self.enabled {
            self.counters
                .entry(id.to_string())
                .or_insert_with(|| Counter::<Duration>::new())
                .begin();
        }
    }

    pub(crate) fn end(&mut self, id: &str) {
        if self.enabled {
            if let Some(counter) = self.counters.get_mut(id) {
                counter.end();
            }
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<&Counter<Duration>> {
        self.counters.get(id)
    }
}

/// Human readable summary of the performance and value counters of `index`.
/// Empty unless the index was created with `statistics_enabled`.
pub fn write_statistics(index: &SpatialIndex) -> String {
    let mut s = String::new();

    let pcounters = index.performance_counters();
    let vcounters = index.value_counters();
    if !pcounters.enabled {
        return s;
    }

    let total = pcounters
        .get("neighborhood-search")
        .map(|c| c.sum().as_secs_f64() * 1000.)
        .unwrap_or(0.);
    writeln!(s, "steps: {}", index.current_timestamp()).unwrap();
    writeln!(s, "neighborhood-search-time: {}ms", total).unwrap();
    writeln!(s).unwrap();

    let mut v = pcounters.counters.iter().collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, pcounter) in v {
        writeln!(s, "{}: avg:{}ms", label, pcounter.avg().as_secs_f64() * 1000.).unwrap();
    }
    writeln!(s).unwrap();

    let mut v = vcounters.counters.iter().filter(|(_, c)| c.len() > 0).collect::<Vec<_>>();
    v.sort_by(|x, y| x.0.cmp(y.0));
    for (label, vcounter) in v {
        writeln!(
            s,
            "{}: min:{} max:{} avg:{}",
            label,
            vcounter.min(),
            vcounter.max(),
            vcounter.avg()
        )
        .unwrap();
    }

    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_counter_statistics() {
        let mut counters = ValueCounters::new(true);
        for v in [3., 1., 2.] {
            counters.add_value("middle", v);
        }
        let c = counters.get("middle").unwrap();
        assert_eq!(c.min(), 1.);
        assert_eq!(c.max(), 3.);
        assert_eq!(c.avg(), 2.);
        assert_eq!(c.last(), Some(2.));
    }

    #[test]
    fn disabled_counters_record_nothing() {
        let mut values = ValueCounters::new(false);
        values.add_value("middle", 1.);
        assert!(values.get("middle").is_none());

        let mut perf = PerformanceCounters::new(false);
        perf.begin("arrange");
        perf.end("arrange");
        assert!(perf.get("arrange").is_none());
    }

    #[test]
    fn unfinished_section_has_zero_average() {
        let mut perf = PerformanceCounters::new(true);
        perf.begin("search");
        assert_eq!(perf.get("search").unwrap().avg(), Duration::ZERO);
        perf.end("search");
        assert_eq!(perf.get("search").unwrap().len(), 1);
    }
}
