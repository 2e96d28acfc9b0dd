//! Executor-seam tests: a miniature table-driven executor drives the
//! call handler through compiled-function activations, register-backed
//! identifier access, environment closing, tail calls, and the
//! resume/yield coroutine transfer.

use std::rc::Rc;

use eider_core::TVal;
use eider_runtime::executor::Executor;
use eider_runtime::{
    Context, ErrCode, ExecStatus, Heap, Instr, LjKind, Unwind, error, handle_tailcall,
    native_thread_resume, native_thread_yield, resume_thread, unwind_native_escape,
};

// Mini instruction set (op numbers private to this executor).
const OP_MOV: u32 = 0; // reg[a] = reg[bc]
const OP_LDCONST: u32 = 2; // reg[a] = const[bc]
const OP_GETVAR: u32 = 10; // reg[a] = lookup(const[bc] as name)
const OP_PUTVAR: u32 = 11; // bind(const[bc] as name) = reg[a]
const OP_ADD: u32 = 20; // reg[a] = reg[b] + reg[c]
const OP_RETURN: u32 = 49; // return reg[a]
const OP_CALL: u32 = 50; // reg[a] = (reg[b])(args reg[b+2]..reg[b+1+c]), this reg[b+1]
const OP_TAILCALL: u32 = 51; // tail call (reg[b])(args as in CALL)
const OP_CLOSEENV: u32 = 52; // close the current environment record

struct MiniExecutor;

impl MiniExecutor {
    fn const_name(heap: &mut Heap, idx: u32) -> String {
        let tv = heap.act_const(idx);
        heap.push_tval(tv).expect("room for name constant");
        let s = heap.get_string(-1).expect("utf8 name constant").to_string();
        heap.pop().expect("name constant pushed");
        s
    }

    fn run(&self, heap: &mut Heap) -> Result<(), Unwind> {
        // Re-entry after a yield: the resume value sits above the
        // register window, destined for the preceding CALL's target reg.
        if heap.get_top() > heap.act_nregs() as usize {
            let v = heap.peek_tval(-1).expect("re-entry value");
            let prev = heap.act_pc().wrapping_sub(1);
            if let Some(i) = heap.act_fetch_instr(prev) {
                if i.op() == OP_CALL {
                    heap.reg_set(i.a(), v);
                }
            }
            heap.set_top(heap.act_nregs() as usize)?;
        }

        loop {
            let pc = heap.act_pc();
            let Some(i) = heap.act_fetch_instr(pc) else {
                // Falling off the end returns undefined.
                heap.push_undefined()?;
                return Ok(());
            };
            heap.act_set_pc(pc + 1);

            match i.op() {
                OP_MOV => {
                    let v = heap.reg_get(i.bc());
                    heap.reg_set(i.a(), v);
                }
                OP_LDCONST => {
                    let v = heap.act_const(i.bc());
                    heap.reg_set(i.a(), v);
                }
                OP_GETVAR => {
                    let name = Self::const_name(heap, i.bc());
                    heap.get_var(&name, true)?;
                    let v = heap.peek_tval(-1).expect("getvar value");
                    heap.reg_set(i.a(), v);
                    heap.pop()?;
                }
                OP_PUTVAR => {
                    let name = Self::const_name(heap, i.bc());
                    let v = heap.reg_get(i.a());
                    heap.push_tval(v)?;
                    heap.put_var(&name)?;
                }
                OP_ADD => {
                    let x = heap.reg_get(i.b()).as_number().unwrap_or(f64::NAN);
                    let y = heap.reg_get(i.c()).as_number().unwrap_or(f64::NAN);
                    heap.reg_set(i.a(), TVal::number(x + y));
                }
                OP_RETURN => {
                    let v = heap.reg_get(i.a());
                    heap.push_tval(v)?;
                    return Ok(());
                }
                OP_CALL => {
                    let nargs = i.c() as usize;
                    heap.push_tval(heap.reg_get(i.b()))?;
                    heap.push_tval(heap.reg_get(i.b() + 1))?;
                    for k in 0..nargs {
                        heap.push_tval(heap.reg_get(i.b() + 2 + k as u32))?;
                    }
                    match heap.call_method(nargs) {
                        Ok(()) => {
                            let v = heap.peek_tval(-1).expect("call result");
                            heap.reg_set(i.a(), v);
                            heap.pop()?;
                        }
                        Err(Unwind::Resume) => {
                            assert_eq!(heap.lj_kind(), LjKind::Resume);
                            let value = heap.lj_value1();
                            let target_tv = heap.lj_value2();
                            let iserror = heap.lj_is_error();
                            let target = target_tv.as_object().expect("resume target");
                            unwind_native_escape(heap);
                            resume_thread(heap, target, value, iserror)?;
                            let v = heap.peek_tval(-1).expect("resume result");
                            heap.reg_set(i.a(), v);
                            heap.pop()?;
                        }
                        Err(e) => return Err(e),
                    }
                }
                OP_TAILCALL => {
                    let nargs = i.c() as usize;
                    heap.push_tval(heap.reg_get(i.b()))?;
                    heap.push_tval(heap.reg_get(i.b() + 1))?;
                    for k in 0..nargs {
                        heap.push_tval(heap.reg_get(i.b() + 2 + k as u32))?;
                    }
                    handle_tailcall(heap, nargs)?;
                    // Activation reused, pc reset; loop continues in the
                    // new target.
                }
                OP_CLOSEENV => {
                    heap.close_current_env()?;
                }
                op => panic!("mini executor: unknown op {op}"),
            }
        }
    }
}

impl Executor for MiniExecutor {
    fn compile(&self, heap: &mut Heap, _flags: u32) -> Result<(), Unwind> {
        Err(error::throw(heap, ErrCode::Unimplemented, "mini executor has no compiler"))
    }

    fn execute(&self, heap: &mut Heap) -> Result<(), Unwind> {
        self.run(heap)
    }
}

fn new_ctx() -> Context {
    let mut ctx = Heap::new();
    ctx.set_executor(Some(Rc::new(MiniExecutor)));
    ctx
}

fn add_const_string(ctx: &mut Context, f: i32, s: &str) -> u32 {
    ctx.push_string(s).unwrap();
    ctx.compfunc_add_constant(f).unwrap() as u32
}

fn add_const_int(ctx: &mut Context, f: i32, v: i32) -> u32 {
    ctx.push_int(v).unwrap();
    ctx.compfunc_add_constant(f).unwrap() as u32
}

#[test]
fn test_compiled_function_add() {
    let mut ctx = new_ctx();
    // function (x, y) { return x + y; }
    let f = ctx.push_compiled_function(3, 2).unwrap();
    ctx.compfunc_set_bytecode(
        f,
        &[
            Instr::enc_op_a_b_c(OP_ADD, 2, 0, 1),
            Instr::enc_op_a_b_c(OP_RETURN, 2, 0, 0),
        ],
        &[1, 1],
    )
    .unwrap();

    ctx.push_int(5).unwrap();
    ctx.push_int(6).unwrap();
    ctx.call(2).unwrap();
    assert_eq!(ctx.get_top(), 1);
    assert_eq!(ctx.get_number(-1), 11.0);
}

#[test]
fn test_arg_clamping_and_padding() {
    let mut ctx = new_ctx();
    // Declared one arg, four registers: extra actual args are dropped and
    // the registers beyond the args come up undefined.
    let f = ctx.push_compiled_function(4, 1).unwrap();
    ctx.compfunc_set_bytecode(
        f,
        &[
            Instr::enc_op_a_b_c(OP_ADD, 3, 0, 2), // x + undefined -> NaN
            Instr::enc_op_a_b_c(OP_RETURN, 3, 0, 0),
        ],
        &[],
    )
    .unwrap();
    ctx.push_int(1).unwrap();
    ctx.push_int(2).unwrap();
    ctx.push_int(3).unwrap();
    ctx.call(3).unwrap();
    assert!(ctx.get_number(-1).is_nan());
}

#[test]
fn test_getvar_register_fast_path_and_global() {
    let mut ctx = new_ctx();
    ctx.push_int(40).unwrap();
    ctx.put_var("g").unwrap();

    let f = ctx.push_compiled_function(3, 1).unwrap();
    ctx.compfunc_set_varmap(f, &[("x", 0)]).unwrap();
    let cx = add_const_string(&mut ctx, f, "x");
    let cg = add_const_string(&mut ctx, f, "g");
    ctx.compfunc_set_bytecode(
        f,
        &[
            Instr::enc_op_a_bc(OP_GETVAR, 1, cx), // register-backed
            Instr::enc_op_a_bc(OP_GETVAR, 2, cg), // walks to the global object
            Instr::enc_op_a_b_c(OP_ADD, 1, 1, 2),
            Instr::enc_op_a_b_c(OP_RETURN, 1, 0, 0),
        ],
        &[1, 2, 3, 4],
    )
    .unwrap();

    ctx.push_int(2).unwrap();
    ctx.call(1).unwrap();
    assert_eq!(ctx.get_number(-1), 42.0);
}

#[test]
fn test_putvar_through_register() {
    let mut ctx = new_ctx();
    let f = ctx.push_compiled_function(2, 1).unwrap();
    ctx.compfunc_set_varmap(f, &[("x", 0)]).unwrap();
    let cx = add_const_string(&mut ctx, f, "x");
    let c9 = add_const_int(&mut ctx, f, 9);
    ctx.compfunc_set_bytecode(
        f,
        &[
            Instr::enc_op_a_bc(OP_LDCONST, 1, c9),
            Instr::enc_op_a_bc(OP_PUTVAR, 1, cx), // writes register 0
            Instr::enc_op_a_bc(OP_GETVAR, 1, cx),
            Instr::enc_op_a_b_c(OP_RETURN, 1, 0, 0),
        ],
        &[],
    )
    .unwrap();
    ctx.push_int(1).unwrap();
    ctx.call(1).unwrap();
    assert_eq!(ctx.get_number(-1), 9.0);
}

#[test]
fn test_env_close_preserves_bindings() {
    let mut ctx = new_ctx();
    let f = ctx.push_compiled_function(2, 1).unwrap();
    ctx.compfunc_set_varmap(f, &[("x", 0)]).unwrap();
    let cx = add_const_string(&mut ctx, f, "x");
    ctx.compfunc_set_bytecode(
        f,
        &[
            // Close the record, then look x up again: the closed record's
            // own property must serve the value.
            Instr::enc_op_a_b_c(OP_CLOSEENV, 0, 0, 0),
            Instr::enc_op_a_bc(OP_GETVAR, 1, cx),
            Instr::enc_op_a_b_c(OP_RETURN, 1, 0, 0),
        ],
        &[],
    )
    .unwrap();
    ctx.push_int(77).unwrap();
    ctx.call(1).unwrap();
    assert_eq!(ctx.get_number(-1), 77.0);
}

#[test]
fn test_tail_call_keeps_callstack_depth() {
    let mut ctx = new_ctx();

    // helper(x): return x + 1
    let helper = ctx.push_compiled_function(2, 1).unwrap();
    let c1 = add_const_int(&mut ctx, helper, 1);
    ctx.compfunc_set_bytecode(
        helper,
        &[
            Instr::enc_op_a_bc(OP_LDCONST, 1, c1),
            Instr::enc_op_a_b_c(OP_ADD, 1, 0, 1),
            Instr::enc_op_a_b_c(OP_RETURN, 1, 0, 0),
        ],
        &[],
    )
    .unwrap();

    // outer(x): tail call helper(x + x)
    let outer = ctx.push_compiled_function(4, 1).unwrap();
    let ch = {
        ctx.dup(helper).unwrap();
        ctx.compfunc_add_constant(outer).unwrap() as u32
    };
    ctx.compfunc_set_bytecode(
        outer,
        &[
            Instr::enc_op_a_bc(OP_LDCONST, 1, ch), // func (this in reg 2)
            Instr::enc_op_a_b_c(OP_ADD, 3, 0, 0), // arg = x + x
            Instr::enc_op_a_b_c(OP_TAILCALL, 0, 1, 1),
        ],
        &[],
    )
    .unwrap();

    ctx.push_int(5).unwrap();
    ctx.call(1).unwrap();
    assert_eq!(ctx.get_number(-1), 11.0);
    // The entry call stack drained fully; the tail call never grew it.
    assert_eq!(ctx.callstack_depth(), 0);
}

#[test]
fn test_resume_yield_roundtrip() {
    let mut ctx = new_ctx();

    // Coroutine body: function (v) { v2 = yield(v + 1); return v2 + 100; }
    let body = ctx.push_compiled_function(5, 1).unwrap();
    let cy = {
        ctx.push_native_function(native_thread_yield, 2).unwrap();
        ctx.compfunc_add_constant(body).unwrap() as u32
    };
    let c1 = add_const_int(&mut ctx, body, 1);
    let c100 = add_const_int(&mut ctx, body, 100);
    ctx.compfunc_set_bytecode(
        body,
        &[
            Instr::enc_op_a_bc(OP_LDCONST, 1, cy), // yield fn (this in reg 2)
            Instr::enc_op_a_bc(OP_LDCONST, 4, c1),
            Instr::enc_op_a_b_c(OP_ADD, 3, 0, 4), // arg = v + 1
            Instr::enc_op_a_b_c(OP_CALL, 0, 1, 1), // r0 = yield(v + 1)
            Instr::enc_op_a_bc(OP_LDCONST, 4, c100),
            Instr::enc_op_a_b_c(OP_ADD, 0, 0, 4),
            Instr::enc_op_a_b_c(OP_RETURN, 0, 0, 0),
        ],
        &[],
    )
    .unwrap();

    // Driver: function (thr) { a = resume(thr, 10, false);
    //                          b = resume(thr, a + 1, false);
    //                          return b; }
    let driver = ctx.push_compiled_function(8, 1).unwrap();
    let cr = {
        ctx.push_native_function(native_thread_resume, 3).unwrap();
        ctx.compfunc_add_constant(driver).unwrap() as u32
    };
    let c10 = add_const_int(&mut ctx, driver, 10);
    let c1d = add_const_int(&mut ctx, driver, 1);
    let cfalse = {
        ctx.push_false().unwrap();
        ctx.compfunc_add_constant(driver).unwrap() as u32
    };
    ctx.compfunc_set_bytecode(
        driver,
        &[
            Instr::enc_op_a_bc(OP_LDCONST, 1, cr), // resume fn (this in reg 2)
            Instr::enc_op_a_bc(OP_MOV, 3, 0), // thread argument
            Instr::enc_op_a_bc(OP_LDCONST, 4, c10),
            Instr::enc_op_a_bc(OP_LDCONST, 5, cfalse),
            Instr::enc_op_a_b_c(OP_CALL, 6, 1, 3), // a = resume(thr, 10, false)
            Instr::enc_op_a_bc(OP_LDCONST, 7, c1d),
            Instr::enc_op_a_b_c(OP_ADD, 4, 6, 7), // val = a + 1
            Instr::enc_op_a_b_c(OP_CALL, 6, 1, 3), // b = resume(thr, val, false)
            Instr::enc_op_a_b_c(OP_RETURN, 6, 0, 0),
        ],
        &[],
    )
    .unwrap();

    // Prepare the coroutine thread with its entry callable.
    let thr_idx = ctx.push_thread().unwrap();
    ctx.thread_prepare(thr_idx, body).unwrap();

    // First resume delivers 10 (body yields 11); second delivers 12
    // (body returns 112).
    ctx.dup(driver).unwrap();
    ctx.dup(thr_idx).unwrap();
    ctx.call(1).unwrap();
    assert_eq!(ctx.get_number(-1), 112.0);
}

#[test]
fn test_yield_outside_resumed_thread_fails() {
    let mut ctx = new_ctx();
    let f = ctx.push_compiled_function(3, 0).unwrap();
    let cy = {
        ctx.push_native_function(native_thread_yield, 2).unwrap();
        ctx.compfunc_add_constant(f).unwrap() as u32
    };
    ctx.compfunc_set_bytecode(
        f,
        &[
            Instr::enc_op_a_bc(OP_LDCONST, 0, cy),
            Instr::enc_op_a_b_c(OP_CALL, 0, 0, 0),
            Instr::enc_op_a_b_c(OP_RETURN, 0, 0, 0),
        ],
        &[],
    )
    .unwrap();
    assert_eq!(ctx.pcall(0), ExecStatus::Error);
    ctx.get_prop_string(-1, "name").unwrap();
    assert_eq!(ctx.get_string(-1), Some("TypeError"));
}

#[test]
fn test_traceback_through_compiled_frames() {
    let mut ctx = new_ctx();
    let f = ctx.push_compiled_function(2, 0).unwrap();
    ctx.compfunc_set_name(f, "failing", "demo.js").unwrap();
    let cthrow = {
        ctx.push_native_function(
            |heap| Err(error::throw(heap, ErrCode::Error, "inner fail")),
            0,
        )
        .unwrap();
        ctx.compfunc_add_constant(f).unwrap() as u32
    };
    ctx.compfunc_set_bytecode(
        f,
        &[
            Instr::enc_op_a_bc(OP_LDCONST, 0, cthrow),
            Instr::enc_op_a_b_c(OP_CALL, 0, 0, 0),
            Instr::enc_op_a_b_c(OP_RETURN, 0, 0, 0),
        ],
        &[3, 4, 5],
    )
    .unwrap();

    assert_eq!(ctx.pcall(0), ExecStatus::Error);
    // Augmentation captured the compiled frame's file and line.
    ctx.get_prop_string(-1, "fileName").unwrap();
    assert_eq!(ctx.get_string(-1), Some("demo.js"));
    ctx.pop().unwrap();
    ctx.get_prop_string(-1, "lineNumber").unwrap();
    // The pc had advanced past the CALL when the error fired.
    assert_eq!(ctx.get_number(-1), 5.0);
}

#[test]
fn test_arguments_object_parameter_map() {
    let mut ctx = new_ctx();
    // function (x) { arguments[0] = 5; return x; } with create-args on.
    let f = ctx.push_compiled_function(5, 1).unwrap();
    ctx.compfunc_configure(f, false, true, true, false).unwrap();
    ctx.compfunc_set_varmap(f, &[("x", 0)]).unwrap();
    ctx.compfunc_set_formals(f, &["x"]).unwrap();
    let ca = add_const_string(&mut ctx, f, "arguments");
    let cx = add_const_string(&mut ctx, f, "x");
    let c5 = add_const_int(&mut ctx, f, 5);
    let cwrite = {
        // native (args_obj, v): args_obj[0] = v
        ctx.push_native_function(
            |heap| {
                heap.dup(1)?;
                heap.put_prop_index(0, 0)?;
                Ok(0)
            },
            2,
        )
        .unwrap();
        ctx.compfunc_add_constant(f).unwrap() as u32
    };
    ctx.compfunc_set_bytecode(
        f,
        &[
            Instr::enc_op_a_bc(OP_GETVAR, 1, ca), // the arguments object
            // call native(args, 5): mutating the index writes through the
            // parameter map into register 0.
            Instr::enc_op_a_bc(OP_MOV, 3, 1),
            Instr::enc_op_a_bc(OP_LDCONST, 4, c5),
            Instr::enc_op_a_bc(OP_LDCONST, 1, cwrite),
            Instr::enc_op_a_b_c(OP_CALL, 1, 1, 2),
            Instr::enc_op_a_bc(OP_GETVAR, 1, cx),
            Instr::enc_op_a_b_c(OP_RETURN, 1, 0, 0),
        ],
        &[],
    )
    .unwrap();

    ctx.push_int(1).unwrap();
    ctx.call(1).unwrap();
    // arguments[0] = 5 reflected into the register-backed x.
    assert_eq!(ctx.get_number(-1), 5.0);
}
