//! Thin helpers around `prometheus::Registry` construction, following the
//! pattern in the teacher's `write::metrics::register_counter_vec`: every
//! component takes a `&Registry` at construction time instead of reaching
//! for a process-wide default registry (see DESIGN NOTES, "Global state").

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

pub fn counter_vec(reg: &Registry, name: &str, help: &str, label_names: &[&str]) -> IntCounterVec {
    let counter = IntCounterVec::new(Opts::new(name, help), label_names)
        .expect("metric options are static and well-formed");
    reg.register(Box::new(counter.clone()))
        .expect("metric name collision");
    counter
}

pub fn histogram(reg: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("metric options are static and well-formed");
    reg.register(Box::new(histogram.clone()))
        .expect("metric name collision");
    histogram
}
