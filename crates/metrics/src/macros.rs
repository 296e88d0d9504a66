/// Register an integer counter with the workspace metrics registry and store
/// it in a static. The reported metric name is the lower_snake_case version of
/// the declared variable name. An optional third argument declares labels.
#[macro_export]
macro_rules! register_backfill_counter {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounter> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    $crate::prometheus::register_int_counter_with_registry!(
                        stringify!([<$NAME:lower>]),
                        $HELP,
                        $crate::METRICS_REGISTRY.clone(),
                    )
                    .expect("Metric initialization failed")
                }
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    $crate::prometheus::register_int_counter_vec_with_registry!(
                        stringify!([<$NAME:lower>]),
                        $HELP,
                        $LABELS,
                        $crate::METRICS_REGISTRY.clone(),
                    )
                    .expect("Metric initialization failed")
                }
            });
    };
}

/// Register an integer gauge with the workspace metrics registry and store it
/// in a static. The reported metric name is the lower_snake_case version of
/// the declared variable name.
#[macro_export]
macro_rules! register_backfill_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntGauge> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    $crate::prometheus::register_int_gauge_with_registry!(
                        stringify!([<$NAME:lower>]),
                        $HELP,
                        $crate::METRICS_REGISTRY.clone(),
                    )
                    .expect("Metric initialization failed")
                }
            });
    };
}

/// Register a histogram with the workspace metrics registry and store it in a
/// static. The reported metric name is the lower_snake_case version of the
/// declared variable name.
#[macro_export]
macro_rules! register_backfill_histogram {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Histogram> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    $crate::prometheus::register_histogram_with_registry!(
                        stringify!([<$NAME:lower>]),
                        $HELP,
                        $crate::METRICS_REGISTRY.clone(),
                    )
                    .expect("Metric initialization failed")
                }
            });
    };
}
