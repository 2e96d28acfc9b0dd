//! End-to-end API scenarios: stack limits, protected-call stack shapes,
//! coercion corner patterns, and number formatting behavior observed
//! through the public surface.

use eider_runtime::{ExecStatus, Heap, INVALID_INDEX, numconv};

#[test]
fn test_stack_extend_fill_and_limit() {
    let mut ctx = Heap::new();
    ctx.set_valstack_limit(1000);
    assert!(ctx.require_stack_top(1000).is_ok());
    for _ in 0..1000 {
        ctx.push_int(123).unwrap();
    }
    assert_eq!(ctx.get_top(), 1000);
    // One more exceeds the configured limit.
    let r = ctx.push_int(123);
    assert!(r.is_err());
    assert_eq!(ctx.error_message().as_deref(), Some("valstack limit reached"));
    assert_eq!(ctx.get_top(), 1000);
    assert_eq!(ctx.get_number(999), 123.0);
}

#[test]
fn test_check_stack_top_huge_fails_cleanly() {
    let mut ctx = Heap::new();
    assert!(!ctx.check_stack_top(1_000_000_000));
    assert_eq!(ctx.get_top(), 0);
    assert_eq!(ctx.get_top_index(), INVALID_INDEX);
}

#[test]
fn test_require_top_index_on_empty() {
    let mut ctx = Heap::new();
    assert!(ctx.require_top_index().is_err());
    assert_eq!(ctx.error_message().as_deref(), Some("invalid index"));
}

#[test]
fn test_pop_too_many_message() {
    let mut ctx = Heap::new();
    ctx.push_int(1).unwrap();
    ctx.push_int(2).unwrap();
    assert!(ctx.pop_n(3).is_err());
    assert_eq!(
        ctx.error_message().as_deref(),
        Some("attempt to pop too many entries")
    );
    // Nothing was popped by the failed request.
    assert_eq!(ctx.get_top(), 2);
}

#[test]
fn test_safe_call_top_always_entry_plus_nrets() {
    let mut ctx = Heap::new();
    for fail in [false, true] {
        ctx.push_int(1).unwrap();
        ctx.push_int(2).unwrap();
        let entry_base = ctx.get_top() - 2;
        let st = if fail {
            ctx.safe_call(
                |heap| Err(eider_runtime::error::throw(heap, eider_runtime::ErrCode::Error, "x")),
                2,
                3,
            )
        } else {
            ctx.safe_call(
                |heap| {
                    heap.push_int(10)?;
                    Ok(1)
                },
                2,
                3,
            )
        };
        assert_eq!(
            st,
            if fail { ExecStatus::Error } else { ExecStatus::Success }
        );
        assert_eq!(ctx.get_top(), entry_base + 3);
        ctx.set_top(entry_base).unwrap();
    }
}

#[test]
fn test_insert_remove_bit_identical() {
    let mut ctx = Heap::new();
    ctx.push_number(0.1).unwrap();
    ctx.push_string("s").unwrap();
    ctx.push_nan().unwrap();
    ctx.push_object().unwrap();
    let before: Vec<u64> = (0..4)
        .map(|i| ctx.peek_tval(i).unwrap().raw_bits())
        .collect();

    ctx.push_string("wedge").unwrap();
    ctx.insert(2).unwrap();
    ctx.remove(2).unwrap();

    let after: Vec<u64> = (0..4)
        .map(|i| ctx.peek_tval(i).unwrap().raw_bits())
        .collect();
    assert_eq!(before, after);
}

#[test]
fn test_join_and_concat_coercion() {
    let mut ctx = Heap::new();
    ctx.push_string(",").unwrap();
    ctx.push_int(1).unwrap();
    ctx.push_string("foo").unwrap();
    ctx.push_object().unwrap();
    ctx.join(3).unwrap();
    assert_eq!(ctx.get_string(-1), Some("1,foo,[object Object]"));
    ctx.pop().unwrap();

    ctx.push_true().unwrap();
    ctx.push_null().unwrap();
    ctx.push_number(2.5).unwrap();
    ctx.concat(3).unwrap();
    assert_eq!(ctx.get_string(-1), Some("truenull2.5"));
}

#[test]
fn test_to_buffer_patterns() {
    let mut ctx = Heap::new();
    ctx.push_undefined().unwrap();
    ctx.to_buffer(-1).unwrap();
    assert_eq!(ctx.get_buffer(-1).unwrap().len(), 9);
    assert_eq!(ctx.get_buffer(-1).unwrap(), b"undefined");
}

#[test]
fn test_number_format_forced_exponent() {
    assert_eq!(numconv::stringify(0.0, 10, 0, numconv::N2S_FORCE_EXP), "0e+0");
    assert_eq!(numconv::stringify(1e23, 10, 0, 0), "1e+23");
}

#[test]
fn test_dragon4_corner_roundtrip() {
    let x = numconv::parse(b"9.999999999999999e307", 10, numconv::S2N_TONUMBER_FLAGS).unwrap();
    assert!(x.is_finite());
    assert_eq!(numconv::stringify(x, 10, 0, 0), "9.999999999999999e+307");
}

#[test]
fn test_number_roundtrip_many_radices() {
    // parse(format(x, B), B) recovers x bit-for-bit. Negative zero is
    // excluded: its string form is "0" by the ECMA rules, which reads
    // back as +0.
    let samples = [
        0.0,
        1.0,
        -1.5,
        0.1,
        1.0 / 3.0,
        6.02214076e23,
        5e-324,
        1.7976931348623157e308,
        -2.2250738585072014e-308,
    ];
    for &x in &samples {
        for radix in 2..=36u32 {
            let s = numconv::stringify(x, radix, 0, 0);
            // Exponent notation only ever appears (and is only parsed
            // back) in radix 10; 'e' is a digit in larger radices.
            let mut flags = numconv::S2N_ALLOW_FRAC
                | numconv::S2N_ALLOW_NAKED_FRAC
                | numconv::S2N_ALLOW_MINUS
                | numconv::S2N_ALLOW_LEADING_ZERO;
            if radix == 10 {
                flags |= numconv::S2N_ALLOW_EXP;
            }
            let y = numconv::parse(s.as_bytes(), radix, flags)
                .unwrap_or_else(|| panic!("parse back {s} radix {radix}"));
            assert_eq!(x.to_bits(), y.to_bits(), "x={x} radix={radix} s={s}");
        }
    }
}

#[test]
fn test_typeof_names() {
    let mut ctx = Heap::new();
    ctx.push_undefined().unwrap();
    assert_eq!(ctx.type_of(-1), "undefined");
    ctx.push_null().unwrap();
    assert_eq!(ctx.type_of(-1), "object");
    ctx.push_native_function(|_| Ok(0), 0).unwrap();
    assert_eq!(ctx.type_of(-1), "function");
    ctx.push_fixed_buffer(1).unwrap();
    assert_eq!(ctx.type_of(-1), "buffer");
    ctx.push_pointer(0x1234).unwrap();
    assert_eq!(ctx.type_of(-1), "pointer");
}

#[test]
fn test_instanceof_through_prototype_chain() {
    let mut ctx = Heap::new();
    let ctor = ctx
        .push_native_function(|_| Ok(0), 0)
        .unwrap();
    let proto = ctx.push_object().unwrap();
    ctx.dup(proto).unwrap();
    ctx.put_prop_string(ctor, "prototype").unwrap();

    ctx.construct(0).unwrap();
    let inst = ctx.get_top_index();
    assert!(ctx.instance_of(inst, ctor).unwrap());

    // An unrelated object is not an instance.
    let other = ctx.push_object().unwrap();
    assert!(!ctx.instance_of(other, ctor).unwrap());
}

#[test]
fn test_multiple_threads_share_interned_strings() {
    let mut ctx = Heap::new();
    ctx.push_string("shared-across-threads").unwrap();
    let t = ctx.push_thread().unwrap();
    assert!(ctx.is_thread(t));
    // The same byte sequence interns to the identical cell.
    ctx.push_string("shared-across-threads").unwrap();
    assert!(ctx.strict_equals(-1, -3));
}
