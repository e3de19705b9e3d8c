use std::fs;
use std::sync::Arc;

use framestore_core::execution::{ExecutionContext, compile};
use framestore_core::planner::{Fuser, NodeId, NodeKind, Plan, PlanGraph, segment, slice};
use framestore_core::testutil::{assert_values_eq, int_array, test_session};
use framestore_core::{LazyArray, Session, Value, ValuePredicate, ValueTransform, ValueType};
use framestore_error::ErrorKind;

fn ints(values: impl IntoIterator<Item = i64>) -> Vec<Value> {
    values.into_iter().map(Value::Integer).collect()
}

/// Pull every row out of a compiled plan on the calling thread.
fn drain(graph: &PlanGraph, root: NodeId, ctx: &ExecutionContext) -> Vec<Vec<Value>> {
    let mut op = compile(graph, root, ctx).unwrap();
    let mut rows = Vec::new();
    while let Some(batch) = op.next_batch(ctx.batch_size()).unwrap() {
        rows.extend(batch.into_rows());
    }
    rows
}

fn segmented(session: &Session, n: i64, segments: usize) -> LazyArray {
    session
        .array(int_array(session.storage(), n, segments))
        .unwrap()
}

fn is_even() -> ValuePredicate {
    ValuePredicate::infallible(|v| v.try_as_i64().unwrap_or(1) % 2 == 0)
}

fn times(k: i64) -> ValueTransform {
    ValueTransform::infallible(move |v| Value::Integer(v.try_as_i64().unwrap_or(0) * k))
}

#[test]
fn end_to_end_filter_then_select() {
    logutil::init_test();
    let session = test_session(2);
    let frame = session
        .frame_from_values(vec![
            ("x", ValueType::Integer, ints(1..=5)),
            ("y", ValueType::String, (1..=5).map(|v| Value::from(format!("y{v}"))).collect()),
        ])
        .unwrap();

    let out = session
        .frame(frame)
        .unwrap()
        .filter("x", ValuePredicate::infallible(|v| v.try_as_i64().unwrap_or(0) > 2))
        .unwrap()
        .select(&["x"])
        .unwrap()
        .materialize()
        .unwrap();

    assert_eq!(vec!["x"], out.column_names());
    assert_values_eq(&ints([3, 4, 5]), &out.column("x").unwrap().read_all().unwrap());
}

#[test]
fn known_lengths_match_output() {
    logutil::init_test();
    let session = test_session(3);
    let x = segmented(&session, 50, 3);
    let frame = x.clone().into_frame("x");

    let cases = vec![
        x.clone(),
        x.apply(times(2), ValueType::Integer).unwrap(),
        x.append(&session.range(-5, 0).unwrap()).unwrap(),
        x.head(17).unwrap(),
        session.constant("c", ValueType::String, 9).unwrap(),
        x.apply(times(0), ValueType::Integer)
            .unwrap()
            .ternary(&x, &session.range(0, 50).unwrap())
            .unwrap(),
        x.aggregate(Arc::new(framestore_core::planner::Sum)).unwrap(),
        frame
            .add_column("y", &x.apply(times(3), ValueType::Integer).unwrap())
            .unwrap()
            .column("y")
            .unwrap(),
    ];
    for case in cases {
        let known = case.known_len().unwrap().expect("length should be known");
        assert_eq!(known, case.materialize().unwrap().len(), "{}", case.plan().explain().unwrap());
    }

    // Data dependent lengths are resolved once and then known.
    let filtered = x.filter(is_even()).unwrap();
    assert_eq!(None, filtered.known_len().unwrap());
    assert_eq!(25, filtered.len().unwrap());
    assert_eq!(Some(25), filtered.known_len().unwrap());
    assert_eq!(25, filtered.materialize().unwrap().len());
}

#[test]
fn slices_compose() {
    logutil::init_test();
    let session = test_session(2);
    let x = segmented(&session, 100, 4);
    let plan = x.apply(times(10), ValueType::Integer).unwrap().plan();

    let outer = slice(&plan, 20, 80).unwrap();
    let inner = slice(&outer, 5, 30).unwrap();
    let ctx = session.context();
    let rows = drain(plan.graph(), inner.root(), &ctx);
    let expected: Vec<Vec<Value>> = (25..50).map(|v| vec![Value::Integer(v * 10)]).collect();
    assert_eq!(expected, rows);

    let err = slice(&outer, 10, 61).unwrap_err();
    assert_eq!(ErrorKind::InvalidRange, err.kind());
}

#[test]
fn segments_concatenate_to_full_output() {
    logutil::init_test();
    let session = test_session(2);
    let len = 37;
    let x = segmented(&session, len, 3);
    let plans = [
        x.apply(times(2), ValueType::Integer).unwrap().plan(),
        // Unknown length, partitioned by the filter's input rows.
        x.filter(is_even())
            .unwrap()
            .apply(times(3), ValueType::Integer)
            .unwrap()
            .plan(),
    ];

    let ctx = session.context();
    for plan in plans {
        let full = drain(plan.graph(), plan.root(), &ctx);
        for n in 1..=len as u64 {
            let mut rows = Vec::new();
            for idx in 0..n {
                let dst = Arc::new(PlanGraph::new());
                let part = segment(&plan, idx, n, &dst).unwrap();
                rows.extend(drain(&dst, part.root(), &ctx));
            }
            assert_eq!(full, rows, "split into {n}");
        }
    }
}

#[test]
fn fusion_preserves_results() {
    logutil::init_test();
    let session = test_session(2);
    let frame = session
        .frame_from_values(vec![
            ("a", ValueType::Integer, ints(0..40)),
            ("b", ValueType::Integer, ints(100..140)),
            ("c", ValueType::Float, (0..40).map(|v| Value::Float(v as f64)).collect()),
        ])
        .unwrap();
    let lazy = session.frame(frame).unwrap();
    let doubled = lazy
        .apply("a", times(2), ValueType::Integer)
        .unwrap()
        .apply(times(5), ValueType::Integer)
        .unwrap();
    let plan = lazy
        .add_column("d", &doubled)
        .unwrap()
        .add_column("e", &session.range(0, 40).unwrap())
        .unwrap()
        .select(&["e", "d", "b", "a"])
        .unwrap()
        .select(&["d", "a"])
        .unwrap()
        .plan();

    let fused = Fuser::default().fuse(&plan).unwrap();
    assert!(fused.graph().num_nodes() < plan.graph().num_nodes());

    let ctx = session.context();
    let expected: Vec<Vec<Value>> = (0..40)
        .map(|v| vec![Value::Integer(v * 10), Value::Integer(v)])
        .collect();
    assert_eq!(expected, drain(plan.graph(), plan.root(), &ctx));
    assert_eq!(expected, drain(fused.graph(), fused.root(), &ctx));
}

#[test]
fn concurrent_materializations() {
    logutil::init_test();
    let session = test_session(4);
    let x = segmented(&session, 4000, 4);

    std::thread::scope(|s| {
        let handles: Vec<_> = (1..=4)
            .map(|k| {
                let x = x.clone();
                s.spawn(move || {
                    let array = x.apply(times(k), ValueType::Integer).unwrap().materialize().unwrap();
                    (k, array)
                })
            })
            .collect();

        for handle in handles {
            let (k, array) = handle.join().unwrap();
            assert!(array.num_segments() >= 2, "expected parallel output");
            assert_values_eq(&ints((0..4000).map(|v| v * k)), &array.read_all().unwrap());
        }
    });
}

#[test]
fn failed_transform_returns_error_and_cleans_up() {
    logutil::init_test();
    let session = test_session(4);
    let x = segmented(&session, 2000, 4);
    let files_before = fs::read_dir(session.storage().path()).unwrap().count();

    let failing = x
        .apply(
            ValueTransform::new(|v| match v.try_as_i64()? {
                1500 => Err("bad row".into()),
                v => Ok(Value::Integer(v)),
            }),
            ValueType::Integer,
        )
        .unwrap();
    let err = failing.materialize().unwrap_err();
    assert_eq!(ErrorKind::OperatorFailure, err.kind(), "{err}");

    let files_after = fs::read_dir(session.storage().path()).unwrap().count();
    assert_eq!(files_before, files_after);

    // The session stays usable.
    assert_eq!(Value::Integer(1999 * 1000), x.sum().unwrap());
}

#[test]
fn reduce_over_filtered_frame() {
    logutil::init_test();
    let session = test_session(3);
    let x = segmented(&session, 101, 3);
    let evens = x.filter(is_even()).unwrap();
    assert_eq!(Value::Integer(2550), evens.sum().unwrap());
    assert_eq!(Value::Integer(51), evens.count().unwrap());
    assert_eq!(Value::Integer(100), evens.max().unwrap());
}

#[test]
fn plans_are_pure_until_materialized() {
    logutil::init_test();
    let session = test_session(2);
    let x = segmented(&session, 10, 1);
    let files = fs::read_dir(session.storage().path()).unwrap().count();

    let y = x
        .apply(times(2), ValueType::Integer)
        .unwrap()
        .filter(is_even())
        .unwrap();
    let plan: &Plan = &y.plan();
    assert!(matches!(plan.node().unwrap().kind(), NodeKind::Filter { .. }));
    assert_eq!(files, fs::read_dir(session.storage().path()).unwrap().count());
}
