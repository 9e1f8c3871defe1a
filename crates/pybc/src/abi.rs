//! The calling contract between emitted code and the runtime-support
//! library. Both the emitter and the runtime read this table, so a unit
//! produced by one always links against the other.

use serde::{Deserialize, Serialize};

pub const DYN: &str = "pylib/Dyn";
pub const PY_OBJECT: &str = "pylib/PyObject";
pub const PY_INSTANCE: &str = "pylib/PyInstance";
pub const PY_EXCEPTION: &str = "pylib/PyException";
pub const CELL: &str = "pylib/Cell";
pub const JAVA_OBJECT: &str = "java/lang/Object";
pub const JAVA_STRING: &str = "java/lang/String";

/// Descriptor of the universal dynamic value type.
pub const OBJ: &str = "Lpylib/PyObject;";
/// Every source-level function and class body has this signature: the
/// capture record followed by the bound positional arguments.
pub const FUNCTION_DESCRIPTOR: &str = "([Lpylib/Cell;[Lpylib/PyObject;)Lpylib/PyObject;";

pub const NONE_FIELD: &str = "NONE";
pub const CLASS_FIELD: &str = "$class";
pub const CLASS_BODY: &str = "$body";
pub const CLINIT: &str = "<clinit>";
pub const CLINIT_DESCRIPTOR: &str = "()V";
pub const MODULE_NAME: &str = "__name__";

/// Local slots shared by every function-shaped method.
pub const CAPTURES_SLOT: u16 = 0;
pub const ARGS_SLOT: u16 = 1;
/// Class bodies keep the class object under construction here.
pub const CLASS_SLOT: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeKind {
    Static,
    Virtual,
    Special,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeMethod {
    pub class: &'static str,
    pub name: &'static str,
    pub descriptor: &'static str,
    pub kind: InvokeKind,
}

/// Entry points of the runtime-support library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeEntry {
    GetAttr,
    SetAttr,
    DelAttr,
    Call,
    CallKw,
    BinaryOp,
    InplaceOp,
    UnaryOp,
    GetItem,
    SetItem,
    DelItem,
    Slice,
    Iter,
    Next,
    Truth,
    Int,
    BigInt,
    Float,
    Str,
    Bool,
    List,
    Tuple,
    Set,
    Dict,
    ListAppend,
    SetAdd,
    MakeFunction,
    MakeClass,
    Publish,
    SuperOf,
    ImportModule,
    ImportFrom,
    Builtin,
    CheckLocal,
    CheckGlobal,
    Raise,
    Reraise,
    ExcMatch,
    AssertFail,
    Enter,
    Exit,
    Unpack,
    CellInit,
    CellGet,
    CellSet,
    ExceptionValue,
}

const fn s(name: &'static str, descriptor: &'static str) -> RuntimeMethod {
    RuntimeMethod { class: DYN, name, descriptor, kind: InvokeKind::Static }
}

impl RuntimeEntry {
    pub const ALL: &'static [RuntimeEntry] = &[
        RuntimeEntry::GetAttr,
        RuntimeEntry::SetAttr,
        RuntimeEntry::DelAttr,
        RuntimeEntry::Call,
        RuntimeEntry::CallKw,
        RuntimeEntry::BinaryOp,
        RuntimeEntry::InplaceOp,
        RuntimeEntry::UnaryOp,
        RuntimeEntry::GetItem,
        RuntimeEntry::SetItem,
        RuntimeEntry::DelItem,
        RuntimeEntry::Slice,
        RuntimeEntry::Iter,
        RuntimeEntry::Next,
        RuntimeEntry::Truth,
        RuntimeEntry::Int,
        RuntimeEntry::BigInt,
        RuntimeEntry::Float,
        RuntimeEntry::Str,
        RuntimeEntry::Bool,
        RuntimeEntry::List,
        RuntimeEntry::Tuple,
        RuntimeEntry::Set,
        RuntimeEntry::Dict,
        RuntimeEntry::ListAppend,
        RuntimeEntry::SetAdd,
        RuntimeEntry::MakeFunction,
        RuntimeEntry::MakeClass,
        RuntimeEntry::Publish,
        RuntimeEntry::SuperOf,
        RuntimeEntry::ImportModule,
        RuntimeEntry::ImportFrom,
        RuntimeEntry::Builtin,
        RuntimeEntry::CheckLocal,
        RuntimeEntry::CheckGlobal,
        RuntimeEntry::Raise,
        RuntimeEntry::Reraise,
        RuntimeEntry::ExcMatch,
        RuntimeEntry::AssertFail,
        RuntimeEntry::Enter,
        RuntimeEntry::Exit,
        RuntimeEntry::Unpack,
        RuntimeEntry::CellInit,
        RuntimeEntry::CellGet,
        RuntimeEntry::CellSet,
        RuntimeEntry::ExceptionValue,
    ];

    pub fn method(self) -> RuntimeMethod {
        use RuntimeEntry::*;
        match self {
            GetAttr => s("getattr", "(Lpylib/PyObject;Ljava/lang/String;)Lpylib/PyObject;"),
            SetAttr => s("setattr", "(Lpylib/PyObject;Ljava/lang/String;Lpylib/PyObject;)V"),
            DelAttr => s("delattr", "(Lpylib/PyObject;Ljava/lang/String;)V"),
            Call => s("call", "(Lpylib/PyObject;[Lpylib/PyObject;)Lpylib/PyObject;"),
            CallKw => s(
                "callKw",
                "(Lpylib/PyObject;[Lpylib/PyObject;[Ljava/lang/String;[Lpylib/PyObject;)Lpylib/PyObject;",
            ),
            BinaryOp => s("binop", "(ILpylib/PyObject;Lpylib/PyObject;)Lpylib/PyObject;"),
            InplaceOp => s("ibinop", "(ILpylib/PyObject;Lpylib/PyObject;)Lpylib/PyObject;"),
            UnaryOp => s("unop", "(ILpylib/PyObject;)Lpylib/PyObject;"),
            GetItem => s("getitem", "(Lpylib/PyObject;Lpylib/PyObject;)Lpylib/PyObject;"),
            SetItem => s("setitem", "(Lpylib/PyObject;Lpylib/PyObject;Lpylib/PyObject;)V"),
            DelItem => s("delitem", "(Lpylib/PyObject;Lpylib/PyObject;)V"),
            Slice => s("slice", "(Lpylib/PyObject;Lpylib/PyObject;Lpylib/PyObject;)Lpylib/PyObject;"),
            Iter => s("iter", "(Lpylib/PyObject;)Lpylib/PyObject;"),
            Next => s("next", "(Lpylib/PyObject;)Lpylib/PyObject;"),
            Truth => s("truth", "(Lpylib/PyObject;)Z"),
            Int => s("int", "(J)Lpylib/PyObject;"),
            BigInt => s("bigint", "(Ljava/lang/String;)Lpylib/PyObject;"),
            Float => s("float", "(D)Lpylib/PyObject;"),
            Str => s("str", "(Ljava/lang/String;)Lpylib/PyObject;"),
            Bool => s("bool", "(Z)Lpylib/PyObject;"),
            List => s("list", "([Lpylib/PyObject;)Lpylib/PyObject;"),
            Tuple => s("tuple", "([Lpylib/PyObject;)Lpylib/PyObject;"),
            Set => s("set", "([Lpylib/PyObject;)Lpylib/PyObject;"),
            Dict => s("dict", "([Lpylib/PyObject;)Lpylib/PyObject;"),
            ListAppend => s("listAppend", "(Lpylib/PyObject;Lpylib/PyObject;)V"),
            SetAdd => s("setAdd", "(Lpylib/PyObject;Lpylib/PyObject;)V"),
            MakeFunction => s(
                "makeFunction",
                "(Ljava/lang/String;Ljava/lang/String;Ljava/lang/String;[Ljava/lang/String;[Lpylib/PyObject;[Lpylib/Cell;)Lpylib/PyObject;",
            ),
            MakeClass => s(
                "makeClass",
                "(Ljava/lang/String;Ljava/lang/String;[Lpylib/PyObject;[Lpylib/Cell;)Lpylib/PyObject;",
            ),
            Publish => s("publish", "(Lpylib/PyObject;Ljava/lang/String;Lpylib/PyObject;)V"),
            SuperOf => s("superOf", "(Lpylib/PyObject;Lpylib/PyObject;)Lpylib/PyObject;"),
            ImportModule => s("importModule", "(Ljava/lang/String;)Lpylib/PyObject;"),
            ImportFrom => s("importFrom", "(Lpylib/PyObject;Ljava/lang/String;)Lpylib/PyObject;"),
            Builtin => s("builtin", "(Ljava/lang/String;)Lpylib/PyObject;"),
            CheckLocal => s("bound", "(Lpylib/PyObject;Ljava/lang/String;)Lpylib/PyObject;"),
            CheckGlobal => s("global", "(Lpylib/PyObject;Ljava/lang/String;)Lpylib/PyObject;"),
            Raise => s("raise", "(Lpylib/PyObject;Lpylib/PyObject;)Lpylib/PyException;"),
            Reraise => s("reraise", "()Lpylib/PyException;"),
            ExcMatch => s("excMatch", "(Lpylib/PyObject;Lpylib/PyObject;)Z"),
            AssertFail => s("assertFail", "(Lpylib/PyObject;)Lpylib/PyException;"),
            Enter => s("enter", "(Lpylib/PyObject;)Lpylib/PyObject;"),
            Exit => s("exit", "(Lpylib/PyObject;Lpylib/PyException;)Z"),
            Unpack => s("unpack", "(Lpylib/PyObject;I)[Lpylib/PyObject;"),
            CellInit => RuntimeMethod { class: CELL, name: "<init>", descriptor: "()V", kind: InvokeKind::Special },
            CellGet => RuntimeMethod {
                class: CELL,
                name: "get",
                descriptor: "()Lpylib/PyObject;",
                kind: InvokeKind::Virtual,
            },
            CellSet => RuntimeMethod {
                class: CELL,
                name: "set",
                descriptor: "(Lpylib/PyObject;)V",
                kind: InvokeKind::Virtual,
            },
            ExceptionValue => RuntimeMethod {
                class: PY_EXCEPTION,
                name: "value",
                descriptor: "()Lpylib/PyObject;",
                kind: InvokeKind::Virtual,
            },
        }
    }

    /// Look up the entry a method reference names.
    pub fn from_member(class: &str, name: &str, descriptor: &str) -> Option<RuntimeEntry> {
        RuntimeEntry::ALL.iter().copied().find(|e| {
            let m = e.method();
            m.class == class && m.name == name && m.descriptor == descriptor
        })
    }
}

/// Binary operator codes passed to `binop`/`ibinop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
    MatMul,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
    IsNot,
    In,
    NotIn,
}

impl Operator {
    const ORDER: [Operator; 23] = [
        Operator::Add,
        Operator::Sub,
        Operator::Mul,
        Operator::Div,
        Operator::FloorDiv,
        Operator::Mod,
        Operator::Pow,
        Operator::LShift,
        Operator::RShift,
        Operator::BitAnd,
        Operator::BitOr,
        Operator::BitXor,
        Operator::MatMul,
        Operator::Eq,
        Operator::Ne,
        Operator::Lt,
        Operator::Le,
        Operator::Gt,
        Operator::Ge,
        Operator::Is,
        Operator::IsNot,
        Operator::In,
        Operator::NotIn,
    ];

    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i32) -> Option<Operator> {
        usize::try_from(code).ok().and_then(|i| Self::ORDER.get(i).copied())
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::FloorDiv => "//",
            Operator::Mod => "%",
            Operator::Pow => "**",
            Operator::LShift => "<<",
            Operator::RShift => ">>",
            Operator::BitAnd => "&",
            Operator::BitOr => "|",
            Operator::BitXor => "^",
            Operator::MatMul => "@",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Is => "is",
            Operator::IsNot => "is not",
            Operator::In => "in",
            Operator::NotIn => "not in",
        }
    }

    /// Whether the runtime-support library implements the operator.
    pub fn is_supported(self) -> bool {
        self != Operator::MatMul
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOperator {
    Neg,
    Pos,
    Invert,
    Not,
}

impl UnaryOperator {
    const ORDER: [UnaryOperator; 4] = [UnaryOperator::Neg, UnaryOperator::Pos, UnaryOperator::Invert, UnaryOperator::Not];

    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i32) -> Option<UnaryOperator> {
        usize::try_from(code).ok().and_then(|i| Self::ORDER.get(i).copied())
    }

    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOperator::Neg => "-",
            UnaryOperator::Pos => "+",
            UnaryOperator::Invert => "~",
            UnaryOperator::Not => "not",
        }
    }
}

/// The fixed builtin namespace, shared read-only by every module pipeline.
pub const BUILTINS: &[&str] = &[
    "abs",
    "all",
    "any",
    "bin",
    "bool",
    "chr",
    "classmethod",
    "delattr",
    "dict",
    "divmod",
    "enumerate",
    "float",
    "getattr",
    "hasattr",
    "hash",
    "hex",
    "id",
    "int",
    "isinstance",
    "issubclass",
    "iter",
    "len",
    "list",
    "max",
    "min",
    "next",
    "object",
    "oct",
    "ord",
    "pow",
    "print",
    "property",
    "range",
    "repr",
    "reversed",
    "round",
    "set",
    "setattr",
    "sorted",
    "staticmethod",
    "str",
    "sum",
    "tuple",
    "type",
    "zip",
    "BaseException",
    "Exception",
    "ArithmeticError",
    "ZeroDivisionError",
    "OverflowError",
    "LookupError",
    "IndexError",
    "KeyError",
    "ValueError",
    "TypeError",
    "AttributeError",
    "NameError",
    "UnboundLocalError",
    "RuntimeError",
    "NotImplementedError",
    "RecursionError",
    "StopIteration",
    "AssertionError",
    "ImportError",
    "ModuleNotFoundError",
    "SystemExit",
    "NotImplemented",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}
