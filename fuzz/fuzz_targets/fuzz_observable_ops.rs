#![no_main]

use std::cell::RefCell;
use std::rc::Rc;

use arbitrary::Arbitrary;
use ftui_observe::{Target, Value, batch, observable, observe, unobserve};
use libfuzzer_sys::fuzz_target;

/// Indices and lengths stay small so growth never allocates much.
const MAX_SLOT: usize = 32;

#[derive(Arbitrary, Debug)]
enum ArrayOp {
    Push(i8),
    Pop,
    Set { index: u8, value: i8 },
    Delete(u8),
    SetLen(u8),
    Splice { start: u8, delete: u8, insert: Vec<i8> },
    Clear,
    Batch(Vec<(u8, i8)>),
}

fn slot(raw: u8) -> usize {
    usize::from(raw) % MAX_SLOT
}

fn apply(list: &ftui_observe::Observable, model: &mut Vec<Option<i8>>, op: &ArrayOp) {
    match op {
        ArrayOp::Push(v) => {
            model.push(Some(*v));
            let len = list.push(i32::from(*v)).unwrap();
            assert_eq!(len, model.len());
        }
        ArrayOp::Pop => {
            let expected = model.pop().flatten().map(i64::from);
            assert_eq!(list.pop().unwrap().as_i64(), expected);
        }
        ArrayOp::Set { index, value } => {
            let i = slot(*index);
            if i >= model.len() {
                model.resize(i + 1, None);
            }
            model[i] = Some(*value);
            list.set(i, i32::from(*value)).unwrap();
        }
        ArrayOp::Delete(index) => {
            let i = slot(*index);
            let removed = model.get_mut(i).and_then(Option::take).is_some();
            assert_eq!(list.delete(i).unwrap(), removed);
        }
        ArrayOp::SetLen(len) => {
            let len = slot(*len);
            model.resize(len, None);
            list.set_len(len).unwrap();
        }
        ArrayOp::Splice { start, delete, insert } => {
            let insert: Vec<i8> = insert.iter().copied().take(MAX_SLOT).collect();
            if model.len() + insert.len() > 4 * MAX_SLOT {
                return;
            }
            let start = slot(*start).min(model.len());
            let delete = usize::from(*delete).min(model.len() - start);
            let expected: Vec<_> = model
                .splice(start..start + delete, insert.iter().map(|v| Some(*v)))
                .collect();
            let removed = list
                .splice(start, delete, insert.iter().map(|v| i32::from(*v)))
                .unwrap();
            let removed: Vec<_> = removed.iter().map(Value::as_i64).collect();
            let expected: Vec<_> = expected.into_iter().map(|v| v.map(i64::from)).collect();
            assert_eq!(removed, expected);
        }
        ArrayOp::Clear => {
            model.clear();
            list.clear().unwrap();
        }
        ArrayOp::Batch(writes) => batch(|| {
            for (index, value) in writes.iter().take(MAX_SLOT) {
                apply(list, model, &ArrayOp::Set { index: *index, value: *value });
            }
        }),
    }
}

fuzz_target!(|ops: Vec<ArrayOp>| {
    let list = observable(&Target::array());
    let mirror = Rc::new(RefCell::new(Vec::new()));
    let (s, out) = (list.clone(), Rc::clone(&mirror));
    let reaction = observe(move || {
        *out.borrow_mut() = s.values().iter().map(Value::as_i64).collect::<Vec<_>>();
    });

    let mut model: Vec<Option<i8>> = Vec::new();
    for op in ops.iter().take(256) {
        apply(&list, &mut model, op);
        let expected: Vec<_> = model.iter().map(|v| v.map(i64::from)).collect();
        assert_eq!(*mirror.borrow(), expected, "mirror diverged after {op:?}");
    }
    unobserve(&reaction);
});
