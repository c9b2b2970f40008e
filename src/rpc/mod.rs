pub mod envelope;
pub mod skeleton;
pub mod stub;

use std::fmt;

use serde::{Deserialize, Serialize};

use self::envelope::TypeTag;
use crate::{Result, WireFsError};

/// Identity of a remote interface. Part of every stub handle; two stubs are
/// interchangeable only when both the interface and the address agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceKind {
    Service,
    Registration,
    Storage,
    Command,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterfaceKind::Service => "Service",
            InterfaceKind::Registration => "Registration",
            InterfaceKind::Storage => "Storage",
            InterfaceKind::Command => "Command",
        };
        write!(f, "{name}")
    }
}

/// One method of a remote interface: its portable name, its parameter type
/// tags (method identity is the pair), and whether its signature declares
/// the transport failure error.
pub struct MethodSpec {
    pub name: &'static str,
    pub arg_types: &'static [TypeTag],
    pub declares_rpc_error: bool,
}

/// The descriptor stubs and skeletons share for one remote interface.
pub struct InterfaceSpec {
    pub kind: InterfaceKind,
    pub methods: &'static [MethodSpec],
}

impl InterfaceSpec {
    /// A remote interface declares the transport failure error on every
    /// method. Backing a skeleton or stub with anything else is fatal.
    pub fn ensure_remote(&self) -> Result<()> {
        for method in self.methods {
            if !method.declares_rpc_error {
                return Err(WireFsError::NotRemote(format!(
                    "{}::{} does not declare the rpc failure error",
                    self.kind, method.name
                )));
            }
        }
        Ok(())
    }

    /// Resolves a method by name and argument type tags.
    pub fn method(&self, name: &str, arg_types: &[TypeTag]) -> Option<&MethodSpec> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.arg_types == arg_types)
    }
}

/// Naming server, client-facing metadata interface.
pub static SERVICE: InterfaceSpec = InterfaceSpec {
    kind: InterfaceKind::Service,
    methods: &[
        MethodSpec {
            name: "is_directory",
            arg_types: &[TypeTag::Path],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "list",
            arg_types: &[TypeTag::Path],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "create_file",
            arg_types: &[TypeTag::Path],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "create_directory",
            arg_types: &[TypeTag::Path],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "delete",
            arg_types: &[TypeTag::Path],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "get_storage",
            arg_types: &[TypeTag::Path],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "lock",
            arg_types: &[TypeTag::Path, TypeTag::Bool],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "unlock",
            arg_types: &[TypeTag::Path, TypeTag::Bool],
            declares_rpc_error: true,
        },
    ],
};

/// Naming server, storage-facing registration interface.
pub static REGISTRATION: InterfaceSpec = InterfaceSpec {
    kind: InterfaceKind::Registration,
    methods: &[MethodSpec {
        name: "register",
        arg_types: &[TypeTag::StorageRef, TypeTag::CommandRef, TypeTag::PathArray],
        declares_rpc_error: true,
    }],
};

/// Storage server, client-facing byte access interface.
pub static STORAGE: InterfaceSpec = InterfaceSpec {
    kind: InterfaceKind::Storage,
    methods: &[
        MethodSpec {
            name: "size",
            arg_types: &[TypeTag::Path],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "read",
            arg_types: &[TypeTag::Path, TypeTag::I64, TypeTag::I32],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "write",
            arg_types: &[TypeTag::Path, TypeTag::I64, TypeTag::Bytes],
            declares_rpc_error: true,
        },
    ],
};

/// Storage server, naming-facing command interface.
pub static COMMAND: InterfaceSpec = InterfaceSpec {
    kind: InterfaceKind::Command,
    methods: &[
        MethodSpec {
            name: "create",
            arg_types: &[TypeTag::Path],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "delete",
            arg_types: &[TypeTag::Path],
            declares_rpc_error: true,
        },
        MethodSpec {
            name: "copy",
            arg_types: &[TypeTag::Path, TypeTag::StorageRef],
            declares_rpc_error: true,
        },
    ],
};

impl InterfaceKind {
    pub fn spec(&self) -> &'static InterfaceSpec {
        match self {
            InterfaceKind::Service => &SERVICE,
            InterfaceKind::Registration => &REGISTRATION,
            InterfaceKind::Storage => &STORAGE,
            InterfaceKind::Command => &COMMAND,
        }
    }
}
