use deyarv_lib::{decompile, DeyarvError, Raw, ISEQ_MAGIC};

fn int(n: i64) -> Raw {
    Raw::Int(n)
}

fn sym(s: &str) -> Raw {
    Raw::Sym(s.to_string())
}

fn string(s: &str) -> Raw {
    Raw::Str(s.to_string())
}

fn inst(parts: Vec<Raw>) -> Raw {
    Raw::List(parts)
}

fn iseq(name: &str, kind: &str, locals: &[&str], arg_size: i64, body: Vec<Raw>) -> Raw {
    Raw::List(vec![
        string(ISEQ_MAGIC),
        int(1),
        int(2),
        int(1),
        Raw::Map(vec![("arg_size".to_string(), int(arg_size))]),
        string(name),
        string("<test>"),
        int(1),
        sym(kind),
        Raw::List(locals.iter().map(|l| sym(l)).collect()),
        int(arg_size),
        Raw::List(Vec::new()),
        Raw::List(body),
    ])
}

fn top(locals: &[&str], body: Vec<Raw>) -> Raw {
    iseq("<compiled>", "top", locals, 0, body)
}

fn method(name: &str, locals: &[&str], arg_size: i64, body: Vec<Raw>) -> Raw {
    iseq(name, "method", locals, arg_size, body)
}

fn block(locals: &[&str], arg_size: i64, body: Vec<Raw>) -> Raw {
    iseq("block in <test>", "block", locals, arg_size, body)
}

#[test]
fn empty_method_body_renders_nil() {
    let raw = method(
        "m",
        &[],
        0,
        vec![inst(vec![sym("putnil")]), inst(vec![sym("leave")])],
    );
    assert_eq!(decompile(&raw).unwrap(), "def m\n  nil\nend");
}

#[test]
fn local_assignment_swallows_the_duplicated_value() {
    // Assignment-as-last-expression duplicates the value before the
    // store; only one statement may come out.
    let raw = method(
        "assign",
        &["a"],
        0,
        vec![
            inst(vec![sym("putobject"), int(10)]),
            inst(vec![sym("dup")]),
            inst(vec![sym("setlocal"), int(2)]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "def assign\n  a = 10\nend");
}

#[test]
fn two_armed_conditional() {
    let raw = top(
        &["x"],
        vec![
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("branchunless"), sym("label_8")]),
            inst(vec![sym("putobject"), int(5)]),
            inst(vec![sym("jump"), sym("label_9")]),
            sym("label_8"),
            inst(vec![sym("putnil")]),
            sym("label_9"),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(
        decompile(&raw).unwrap(),
        "if x\n  5\nelse\n  nil\nend"
    );
}

#[test]
fn elsif_chain_folds_flat_with_a_single_end() {
    let raw = top(
        &["x", "y", "z"],
        vec![
            inst(vec![sym("getlocal"), int(4)]),
            inst(vec![sym("branchunless"), sym("label_a")]),
            inst(vec![sym("putobject"), int(5)]),
            inst(vec![sym("jump"), sym("label_end")]),
            sym("label_a"),
            inst(vec![sym("getlocal"), int(3)]),
            inst(vec![sym("branchunless"), sym("label_b")]),
            inst(vec![sym("putobject"), int(10)]),
            inst(vec![sym("jump"), sym("label_end")]),
            sym("label_b"),
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("branchunless"), sym("label_c")]),
            inst(vec![sym("putobject"), int(20)]),
            inst(vec![sym("jump"), sym("label_end")]),
            sym("label_c"),
            inst(vec![sym("putnil")]),
            sym("label_end"),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(
        decompile(&raw).unwrap(),
        "if x\n  5\nelsif y\n  10\nelsif z\n  20\nelse\n  nil\nend"
    );
}

#[test]
fn branchif_renders_a_guard_form() {
    let raw = top(
        &["z"],
        vec![
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("branchif"), sym("label_8")]),
            inst(vec![sym("putobject"), int(1)]),
            inst(vec![sym("jump"), sym("label_9")]),
            sym("label_8"),
            inst(vec![sym("putnil")]),
            sym("label_9"),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(
        decompile(&raw).unwrap(),
        "unless z\n  1\nelse\n  nil\nend"
    );
}

#[test]
fn nested_infix_operand_keeps_its_parens() {
    let raw = top(
        &[],
        vec![
            inst(vec![sym("putobject"), int(1)]),
            inst(vec![sym("putobject"), int(2)]),
            inst(vec![sym("opt_plus")]),
            inst(vec![sym("putobject"), int(3)]),
            inst(vec![sym("opt_mult")]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "(1 + 2) * 3");
}

#[test]
fn operator_methods_render_infix() {
    let raw = method(
        "plus",
        &["a", "b"],
        2,
        vec![
            inst(vec![sym("getlocal"), int(3)]),
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("opt_plus")]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "def plus(a, b)\n  a + b\nend");

    let raw = method(
        "cmp",
        &["a", "b"],
        2,
        vec![
            inst(vec![sym("getlocal"), int(3)]),
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("send"), sym("<=>"), int(1), Raw::Null]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "def cmp(a, b)\n  a <=> b\nend");
}

#[test]
fn indexed_read_and_write() {
    let raw = method(
        "aref",
        &["arr", "key"],
        2,
        vec![
            inst(vec![sym("getlocal"), int(3)]),
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("opt_aref")]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "def aref(arr, key)\n  arr[key]\nend");

    let raw = method(
        "aset",
        &["arr", "key", "val"],
        3,
        vec![
            inst(vec![sym("getlocal"), int(4)]),
            inst(vec![sym("getlocal"), int(3)]),
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("opt_aset")]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(
        decompile(&raw).unwrap(),
        "def aset(arr, key, val)\n  arr[key] = val\nend"
    );
}

#[test]
fn indexed_assignment_send_suppresses_the_leftover_value() {
    // The compiled form leaves the assigned value below the receiver;
    // only the assignment statement may come out.
    let raw = top(
        &["arr", "key", "val"],
        vec![
            inst(vec![sym("putobject"), int(9)]),
            inst(vec![sym("getlocal"), int(4)]),
            inst(vec![sym("getlocal"), int(3)]),
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("send"), sym("[]="), int(2), Raw::Null]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "arr[key] = val");
}

#[test]
fn instance_and_global_variables() {
    let raw = top(
        &[],
        vec![
            inst(vec![sym("putobject"), int(5)]),
            inst(vec![sym("dup")]),
            inst(vec![sym("setinstancevariable"), sym("@x")]),
            inst(vec![sym("getinstancevariable"), sym("@x")]),
            inst(vec![sym("dup")]),
            inst(vec![sym("setglobal"), sym("$y")]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "@x = 5\n$y = @x");
}

#[test]
fn special_variables_decode_the_packed_name() {
    let raw = top(
        &[],
        vec![
            inst(vec![sym("getspecial"), int(1), int(('~' as i64) * 2 + 1)]),
            inst(vec![sym("getspecial"), int(2), int(1 << 1)]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "$~\n$1");
}

#[test]
fn constants_resolve_their_scoping_base() {
    let raw = top(
        &[],
        vec![
            inst(vec![sym("putobject"), int(7)]),
            inst(vec![sym("dup")]),
            inst(vec![sym("putnil")]),
            inst(vec![sym("setconstant"), sym("MAX")]),
            inst(vec![sym("putnil")]),
            inst(vec![sym("getconstant"), sym("B")]),
            inst(vec![sym("getconstant"), sym("C")]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "MAX = 7\nB::C");
}

#[test]
fn literal_builders() {
    let raw = top(
        &["a"],
        vec![
            inst(vec![sym("putobject"), int(1)]),
            inst(vec![sym("putobject"), int(2)]),
            inst(vec![sym("newarray"), int(2)]),
            inst(vec![sym("putobject"), sym("a")]),
            inst(vec![sym("putobject"), int(1)]),
            inst(vec![sym("newhash"), int(2)]),
            inst(vec![sym("putobject"), int(1)]),
            inst(vec![sym("putobject"), int(5)]),
            inst(vec![sym("newrange"), int(0)]),
            inst(vec![sym("putobject"), int(1)]),
            inst(vec![sym("putobject"), int(5)]),
            inst(vec![sym("newrange"), int(1)]),
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("splatarray")]),
            inst(vec![sym("duparray"), Raw::List(vec![int(9)])]),
            inst(vec![sym("concatarray")]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(
        decompile(&raw).unwrap(),
        "[1, 2]\n{:a => 1}\n(1..5)\n(1...5)\na + [9]"
    );
}

#[test]
fn string_interpolation_concatenates() {
    let raw = top(
        &["x"],
        vec![
            inst(vec![sym("putobject"), string("n = ")]),
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("tostring")]),
            inst(vec![sym("concatstrings"), int(2)]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "\"n = \" + (x.to_s)");
}

#[test]
fn sends_with_blocks_nest_their_body() {
    let blk = block(
        &["x"],
        1,
        vec![
            inst(vec![sym("putnil")]),
            inst(vec![sym("getdynamic"), int(2), int(0)]),
            inst(vec![sym("send"), sym("p"), int(1), Raw::Null]),
            inst(vec![sym("leave")]),
        ],
    );
    let raw = method(
        "has_a_block",
        &["a"],
        1,
        vec![
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("send"), sym("each"), int(0), blk]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(
        decompile(&raw).unwrap(),
        "def has_a_block(a)\n  a.each do |x|\n    p(x)\n  end\nend"
    );
}

#[test]
fn dynamic_variables_reach_the_enclosing_scope() {
    let blk = block(
        &[],
        0,
        vec![
            inst(vec![sym("putnil")]),
            inst(vec![sym("getdynamic"), int(2), int(1)]),
            inst(vec![sym("send"), sym("p"), int(1), Raw::Null]),
            inst(vec![sym("leave")]),
        ],
    );
    let raw = method(
        "m",
        &["a"],
        1,
        vec![
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("send"), sym("each"), int(0), blk]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(
        decompile(&raw).unwrap(),
        "def m(a)\n  a.each do\n    p(a)\n  end\nend"
    );
}

#[test]
fn intercepted_method_definition() {
    let body = method(
        "<ignored>",
        &[],
        0,
        vec![inst(vec![sym("putnil")]), inst(vec![sym("leave")])],
    );
    let raw = top(
        &[],
        vec![
            inst(vec![sym("putspecialobject"), int(1)]),
            inst(vec![sym("putspecialobject"), int(2)]),
            inst(vec![sym("putobject"), sym("greet")]),
            inst(vec![sym("putiseq"), body]),
            inst(vec![sym("send"), sym("core#define_method"), int(3), Raw::Null]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "def greet\n  nil\nend");
}

#[test]
fn intercepted_singleton_method_definition() {
    let body = method(
        "<ignored>",
        &[],
        0,
        vec![inst(vec![sym("putnil")]), inst(vec![sym("leave")])],
    );
    let raw = top(
        &[],
        vec![
            inst(vec![sym("putspecialobject"), int(1)]),
            inst(vec![sym("putself")]),
            inst(vec![sym("putobject"), sym("greet")]),
            inst(vec![sym("putiseq"), body]),
            inst(vec![
                sym("send"),
                sym("core#define_singleton_method"),
                int(3),
                Raw::Null,
            ]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "def self.greet\n  nil\nend");
}

#[test]
fn class_module_and_metaclass_definitions() {
    let body = |name: &str| {
        iseq(
            name,
            "class",
            &[],
            0,
            vec![inst(vec![sym("putnil")]), inst(vec![sym("leave")])],
        )
    };

    let raw = top(
        &[],
        vec![
            inst(vec![sym("putnil")]),
            inst(vec![sym("putnil")]),
            inst(vec![sym("defineclass"), sym("A"), body("<class:A>"), int(0)]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "class A\n  nil\nend");

    let raw = top(
        &[],
        vec![
            inst(vec![sym("putnil")]),
            inst(vec![sym("putnil")]),
            inst(vec![sym("defineclass"), sym("A"), body("<module:A>"), int(2)]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "module A\n  nil\nend");

    let raw = top(
        &[],
        vec![
            inst(vec![sym("putself")]),
            inst(vec![sym("putnil")]),
            inst(vec![
                sym("defineclass"),
                sym("singletonclass"),
                body("singletonclass"),
                int(1),
            ]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "class << self\n  nil\nend");
}

#[test]
fn class_definition_with_base_and_superclass() {
    let body = iseq(
        "<class:A>",
        "class",
        &[],
        0,
        vec![inst(vec![sym("putnil")]), inst(vec![sym("leave")])],
    );
    let raw = top(
        &[],
        vec![
            inst(vec![sym("putnil")]),
            inst(vec![sym("getconstant"), sym("B")]),
            inst(vec![sym("getconstant"), sym("C")]),
            inst(vec![sym("putnil")]),
            inst(vec![sym("getconstant"), sym("Base")]),
            inst(vec![sym("defineclass"), sym("A"), body, int(0)]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "class B::C::A < Base\n  nil\nend");
}

#[test]
fn super_with_and_without_explicit_arguments() {
    let raw = method(
        "m",
        &[],
        0,
        vec![
            inst(vec![sym("putobject"), Raw::Bool(true)]),
            inst(vec![sym("putobject"), int(5)]),
            inst(vec![sym("invokesuper"), int(1), Raw::Null]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "def m\n  super(5)\nend");

    let raw = method(
        "m",
        &[],
        0,
        vec![
            inst(vec![sym("putobject"), Raw::Bool(false)]),
            inst(vec![sym("invokesuper"), int(0), Raw::Null]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "def m\n  super\nend");
}

#[test]
fn yield_renders_without_a_receiver() {
    let raw = method(
        "m",
        &[],
        0,
        vec![
            inst(vec![sym("putobject"), int(5)]),
            inst(vec![sym("invokeblock"), int(1)]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "def m\n  yield(5)\nend");
}

#[test]
fn throw_states_map_to_control_keywords() {
    let raw = block(
        &[],
        0,
        vec![
            inst(vec![sym("putobject"), int(5)]),
            inst(vec![sym("throw"), int(2)]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), " do\n  break(5)\nend");

    let raw = block(
        &[],
        0,
        vec![
            inst(vec![sym("putnil")]),
            inst(vec![sym("throw"), int(4)]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), " do\n  retry\nend");
}

#[test]
fn negation_and_receiver_shorthand_methods() {
    let raw = top(
        &["a"],
        vec![
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("opt_not")]),
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("opt_length")]),
            inst(vec![sym("getlocal"), int(2)]),
            inst(vec![sym("opt_succ")]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "!a\na.length\na.succ");
}

#[test]
fn inline_cache_gets_act_as_nil_scoping() {
    let raw = top(
        &[],
        vec![
            inst(vec![sym("getinlinecache"), sym("label_7"), int(0)]),
            inst(vec![sym("getconstant"), sym("A")]),
            inst(vec![sym("setinlinecache"), int(0)]),
            inst(vec![sym("leave")]),
        ],
    );
    assert_eq!(decompile(&raw).unwrap(), "A");
}

#[test]
fn bad_magic_is_invalid() {
    let raw = Raw::List(vec![
        string("SomethingElse"),
        int(1),
        int(2),
        int(1),
        Raw::Map(vec![]),
        string("t"),
        string("<test>"),
        int(1),
        sym("top"),
        Raw::List(vec![]),
        int(0),
        Raw::List(vec![]),
        Raw::List(vec![]),
    ]);
    assert!(matches!(
        decompile(&raw),
        Err(DeyarvError::InvalidSequence(_))
    ));
}

#[test]
fn unknown_version_triple_is_unsupported() {
    let raw = Raw::List(vec![
        string(ISEQ_MAGIC),
        int(1),
        int(3),
        int(1),
        Raw::Map(vec![]),
        string("t"),
        string("<test>"),
        int(1),
        sym("top"),
        Raw::List(vec![]),
        int(0),
        Raw::List(vec![]),
        Raw::List(vec![]),
    ]);
    assert!(matches!(
        decompile(&raw),
        Err(DeyarvError::UnsupportedFormat { major: 1, minor: 3, patch: 1 })
    ));
}

#[test]
fn underflow_reports_the_opcode_and_position() {
    let raw = top(&[], vec![inst(vec![sym("opt_plus")])]);
    match decompile(&raw) {
        Err(DeyarvError::StackUnderflow { opcode, position }) => {
            assert_eq!(opcode, "opt_plus");
            assert_eq!(position, 0);
        }
        other => panic!("expected StackUnderflow, got {other:?}"),
    }
}

#[test]
fn out_of_scope_dynamic_variable_is_reported() {
    let raw = top(&[], vec![inst(vec![sym("getdynamic"), int(2), int(1)])]);
    assert!(matches!(
        decompile(&raw),
        Err(DeyarvError::UnresolvedVariable { index: 2, depth: 1 })
    ));
}
