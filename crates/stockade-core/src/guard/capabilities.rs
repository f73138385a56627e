//! Table of capabilities denied to sandboxed code

use serde::Serialize;

/// What a capability grants the code that holds it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityClass {
    /// Reading interactive input
    Input,
    /// Opening arbitrary files
    FileAccess,
    /// Running shells or spawning processes
    ProcessSpawn,
}

/// Where a denied capability lives in the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// A name on the builtins module, replaced process-wide
    Builtin(&'static str),
    /// An attribute of a module, replaced process-wide
    ModuleAttr {
        module: &'static str,
        attr: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Name reported when the capability is blocked
    pub name: &'static str,
    pub class: CapabilityClass,
    pub binding: Binding,
}

const fn builtin(name: &'static str, attr: &'static str, class: CapabilityClass) -> Capability {
    Capability {
        name,
        class,
        binding: Binding::Builtin(attr),
    }
}

const fn attr(
    name: &'static str,
    module: &'static str,
    attr: &'static str,
    class: CapabilityClass,
) -> Capability {
    Capability {
        name,
        class,
        binding: Binding::ModuleAttr { module, attr },
    }
}

use CapabilityClass::{FileAccess, Input, ProcessSpawn};

/// Capabilities stubbed out in every guarded artifact
pub const DENIED: &[Capability] = &[
    builtin("input()", "input", Input),
    builtin("breakpoint()", "breakpoint", Input),
    builtin("open()", "open", FileAccess),
    attr("io.open", "io", "open", FileAccess),
    attr("os.open", "os", "open", FileAccess),
    attr("os.system", "os", "system", ProcessSpawn),
    attr("os.popen", "os", "popen", ProcessSpawn),
    attr("os.fork", "os", "fork", ProcessSpawn),
    attr("os.forkpty", "os", "forkpty", ProcessSpawn),
    attr("os.execv", "os", "execv", ProcessSpawn),
    attr("os.execve", "os", "execve", ProcessSpawn),
    attr("os.execl", "os", "execl", ProcessSpawn),
    attr("os.execle", "os", "execle", ProcessSpawn),
    attr("os.execlp", "os", "execlp", ProcessSpawn),
    attr("os.execlpe", "os", "execlpe", ProcessSpawn),
    attr("os.execvp", "os", "execvp", ProcessSpawn),
    attr("os.execvpe", "os", "execvpe", ProcessSpawn),
    attr("os.spawnv", "os", "spawnv", ProcessSpawn),
    attr("os.spawnve", "os", "spawnve", ProcessSpawn),
    attr("os.spawnl", "os", "spawnl", ProcessSpawn),
    attr("os.spawnle", "os", "spawnle", ProcessSpawn),
    attr("os.spawnlp", "os", "spawnlp", ProcessSpawn),
    attr("os.spawnvp", "os", "spawnvp", ProcessSpawn),
    attr("os.posix_spawn", "os", "posix_spawn", ProcessSpawn),
    attr("os.posix_spawnp", "os", "posix_spawnp", ProcessSpawn),
    attr("subprocess.Popen", "subprocess", "Popen", ProcessSpawn),
    attr("subprocess.run", "subprocess", "run", ProcessSpawn),
    attr("subprocess.call", "subprocess", "call", ProcessSpawn),
    attr("subprocess.check_call", "subprocess", "check_call", ProcessSpawn),
    attr("subprocess.check_output", "subprocess", "check_output", ProcessSpawn),
    attr("subprocess.getoutput", "subprocess", "getoutput", ProcessSpawn),
    attr("subprocess.getstatusoutput", "subprocess", "getstatusoutput", ProcessSpawn),
    attr("pty.spawn", "pty", "spawn", ProcessSpawn),
    attr("posix.system", "posix", "system", ProcessSpawn),
    attr("posix.fork", "posix", "fork", ProcessSpawn),
    attr("posix.forkpty", "posix", "forkpty", ProcessSpawn),
    attr("posix.execv", "posix", "execv", ProcessSpawn),
    attr("posix.execve", "posix", "execve", ProcessSpawn),
    attr("posix.posix_spawn", "posix", "posix_spawn", ProcessSpawn),
    attr("posix.posix_spawnp", "posix", "posix_spawnp", ProcessSpawn),
    attr("nt.system", "nt", "system", ProcessSpawn),
    attr("nt.execv", "nt", "execv", ProcessSpawn),
    attr("nt.execve", "nt", "execve", ProcessSpawn),
    attr("nt.spawnv", "nt", "spawnv", ProcessSpawn),
    attr("nt.spawnve", "nt", "spawnve", ProcessSpawn),
    attr("nt.startfile", "nt", "startfile", ProcessSpawn),
    attr("_posixsubprocess.fork_exec", "_posixsubprocess", "fork_exec", ProcessSpawn),
];

/// One denied entry as the artifact reads it
#[derive(Debug, Serialize)]
pub(crate) struct DeniedEntry {
    name: &'static str,
    class: CapabilityClass,
    module: Option<&'static str>,
    attr: &'static str,
}

pub(crate) fn render(table: &[Capability]) -> Vec<DeniedEntry> {
    table
        .iter()
        .map(|cap| match cap.binding {
            Binding::Builtin(attr) => DeniedEntry {
                name: cap.name,
                class: cap.class,
                module: None,
                attr,
            },
            Binding::ModuleAttr { module, attr } => DeniedEntry {
                name: cap.name,
                class: cap.class,
                module: Some(module),
                attr,
            },
        })
        .collect()
}
