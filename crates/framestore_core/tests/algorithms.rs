use framestore_core::algorithms::JoinStrategy;
use framestore_core::algorithms::join::join_with;
use framestore_core::testutil::{assert_values_eq, test_settings};
use framestore_core::{Frame, JoinType, Session, SortKey, Value, ValueType};
use framestore_error::ErrorKind;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

fn small_buffer_session(workers: u64) -> Session {
    let session = Session::with_settings(test_settings(workers)).unwrap();
    session.set("sort_buffer_size", 1024).unwrap();
    session.set("join_buffer_size", 1024).unwrap();
    session
}

fn ints(values: &[i64]) -> Vec<Value> {
    values.iter().map(|v| Value::Integer(*v)).collect()
}

#[test]
fn sort_spills_and_stays_stable() {
    logutil::init_test();
    let session = small_buffer_session(3);
    let mut rng = StdRng::seed_from_u64(11);
    let n = 3000;
    let keys: Vec<Value> = (0..n).map(|_| Value::Integer(rng.random_range(0..50))).collect();
    let frame = session
        .frame_from_values(vec![
            ("key", ValueType::Integer, keys.clone()),
            ("pos", ValueType::Integer, (0..n).map(Value::Integer).collect()),
        ])
        .unwrap();

    let sorted = session.sort(&frame, &[SortKey::ascending("key")]).unwrap();
    assert_eq!(n as u64, sorted.len());

    let mut expected: Vec<(Value, Value)> = keys
        .into_iter()
        .zip((0..n).map(Value::Integer))
        .collect();
    // Stable, so positions stay ascending within a key.
    expected.sort_by(|a, b| a.0.cmp(&b.0));

    let rows = sorted.read_rows().unwrap();
    for (row, (key, pos)) in rows.iter().zip(&expected) {
        assert_eq!(&row[0], key);
        assert_eq!(&row[1], pos);
    }
}

fn join_inputs(session: &Session) -> (Frame, Frame) {
    let left = session
        .frame_from_values(vec![
            ("k", ValueType::Integer, ints(&[1, 2, 3])),
            ("l", ValueType::String, ["a", "b", "c"].into_iter().map(Value::from).collect()),
        ])
        .unwrap();
    let right = session
        .frame_from_values(vec![
            ("k", ValueType::Integer, ints(&[2, 3, 4])),
            ("r", ValueType::String, ["x", "y", "z"].into_iter().map(Value::from).collect()),
        ])
        .unwrap();
    (left, right)
}

#[test]
fn join_counts_and_fill() {
    logutil::init_test();
    let session = small_buffer_session(2);
    let (left, right) = join_inputs(&session);

    for strategy in [JoinStrategy::Hash, JoinStrategy::SortMerge] {
        let ctx = session.context();
        let inner = join_with(&left, &right, &[("k", "k")], JoinType::Inner, strategy, &ctx).unwrap();
        assert_eq!(2, inner.len(), "{strategy:?}");
        assert_eq!(vec!["k", "l", "r"], inner.column_names());

        let left_join = join_with(&left, &right, &[("k", "k")], JoinType::Left, strategy, &ctx).unwrap();
        assert_eq!(3, left_join.len());
        let mut rows = left_join.read_rows().unwrap();
        rows.sort();
        assert_eq!(
            vec![Value::Integer(1), Value::from("a"), Value::Undefined],
            rows[0],
            "{strategy:?}"
        );

        let outer = join_with(&left, &right, &[("k", "k")], JoinType::Outer, strategy, &ctx).unwrap();
        let mut rows = outer.read_rows().unwrap();
        rows.sort();
        assert_eq!(4, rows.len());
        assert_eq!(
            vec![Value::Integer(4), Value::Undefined, Value::from("z")],
            rows[3],
            "{strategy:?}"
        );
    }
}

#[test]
fn join_auto_falls_back_to_sort_merge() {
    logutil::init_test();
    let session = small_buffer_session(2);
    let n = 2000;
    let left = session
        .frame_from_values(vec![("k", ValueType::Integer, (0..n).map(Value::Integer).collect())])
        .unwrap();
    let right = session
        .frame_from_values(vec![
            ("k", ValueType::Integer, (0..n).rev().map(|v| Value::Integer(v * 2)).collect()),
            ("v", ValueType::Integer, (0..n).rev().map(Value::Integer).collect()),
        ])
        .unwrap();

    let out = session.join(&left, &right, &[("k", "k")], JoinType::Inner).unwrap();
    assert_eq!(n as u64 / 2, out.len());
    for row in out.read_rows().unwrap() {
        assert_eq!(row[0].try_as_i64().unwrap(), row[1].try_as_i64().unwrap() * 2);
    }
}

#[test]
fn permutation_applies_and_validates() {
    logutil::init_test();
    let session = small_buffer_session(3);
    let n = 600;
    let frame = session
        .frame_from_values(vec![
            ("v", ValueType::Integer, (0..n).map(Value::Integer).collect()),
            ("s", ValueType::String, (0..n).map(|v| Value::from(format!("{v:05}"))).collect()),
        ])
        .unwrap();

    let mut dests: Vec<i64> = (0..n).collect();
    dests.shuffle(&mut StdRng::seed_from_u64(5));
    let map = session.array_from_values(ValueType::Integer, ints(&dests)).unwrap();
    let out = session.permute(&frame, &map).unwrap();

    let mut expected = vec![Value::Undefined; n as usize];
    for (src, dest) in dests.iter().enumerate() {
        expected[*dest as usize] = Value::Integer(src as i64);
    }
    assert_values_eq(&expected, &out.column("v").unwrap().read_all().unwrap());

    // Inverting the permutation restores the input.
    let mut inverse = vec![0; n as usize];
    for (src, dest) in dests.iter().enumerate() {
        inverse[*dest as usize] = src as i64;
    }
    let inverse = session.array_from_values(ValueType::Integer, ints(&inverse)).unwrap();
    let restored = session.permute(&out, &inverse).unwrap();
    assert_eq!(frame.read_rows().unwrap(), restored.read_rows().unwrap());

    let mut dup = dests.clone();
    dup[10] = dup[11];
    let dup = session.array_from_values(ValueType::Integer, ints(&dup)).unwrap();
    let err = session.permute(&frame, &dup).unwrap_err();
    assert_eq!(ErrorKind::PermutationAssertion, err.kind(), "{err}");

    let mut out_of_range = dests.clone();
    out_of_range[0] = n;
    let out_of_range = session.array_from_values(ValueType::Integer, ints(&out_of_range)).unwrap();
    let err = session.permute(&frame, &out_of_range).unwrap_err();
    assert_eq!(ErrorKind::PermutationAssertion, err.kind(), "{err}");
}
