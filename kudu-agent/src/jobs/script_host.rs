//! Script hosts
//!
//! Maps a job's script file to the program that runs it. A job directory is
//! runnable when one of its top-level files is supported by a host; files
//! named `run.*` win over everything else.

use std::path::{Path, PathBuf};

#[derive(Debug, PartialEq, Eq)]
pub struct ScriptHost {
    pub name: &'static str,
    extensions: &'static [&'static str],
    /// Interpreter; `None` runs the script directly
    program: Option<&'static str>,
    args: &'static [&'static str],
}

#[cfg(windows)]
const HOSTS: &[ScriptHost] = &[
    ScriptHost {
        name: "cmd",
        extensions: &["cmd", "bat"],
        program: Some("cmd"),
        args: &["/c"],
    },
    ScriptHost {
        name: "exe",
        extensions: &["exe"],
        program: None,
        args: &[],
    },
    ScriptHost {
        name: "powershell",
        extensions: &["ps1"],
        program: Some("powershell.exe"),
        args: &["-ExecutionPolicy", "RemoteSigned", "-File"],
    },
    ScriptHost {
        name: "bash",
        extensions: &["sh"],
        program: Some("bash"),
        args: &[],
    },
    ScriptHost {
        name: "python",
        extensions: &["py"],
        program: Some("python"),
        args: &[],
    },
    ScriptHost {
        name: "php",
        extensions: &["php"],
        program: Some("php"),
        args: &[],
    },
    ScriptHost {
        name: "node",
        extensions: &["js"],
        program: Some("node"),
        args: &[],
    },
];

#[cfg(not(windows))]
const HOSTS: &[ScriptHost] = &[
    ScriptHost {
        name: "bash",
        extensions: &["sh"],
        program: Some("bash"),
        args: &[],
    },
    ScriptHost {
        name: "powershell",
        extensions: &["ps1"],
        program: Some("pwsh"),
        args: &["-File"],
    },
    ScriptHost {
        name: "python",
        extensions: &["py"],
        program: Some("python3"),
        args: &[],
    },
    ScriptHost {
        name: "php",
        extensions: &["php"],
        program: Some("php"),
        args: &[],
    },
    ScriptHost {
        name: "node",
        extensions: &["js"],
        program: Some("node"),
        args: &[],
    },
];

/// Hosts in priority order
pub fn hosts() -> &'static [ScriptHost] {
    HOSTS
}

impl ScriptHost {
    pub fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|supported| supported.eq_ignore_ascii_case(ext))
            })
    }

    /// Program and arguments that run `script` with `arguments` appended
    pub fn command(&self, script: &Path, arguments: Option<&str>) -> (String, Vec<String>) {
        let script = script.to_string_lossy().into_owned();
        let (program, mut args) = match self.program {
            Some(program) => {
                let mut args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
                args.push(script);
                (program.to_string(), args)
            }
            None => (script, Vec::new()),
        };
        if let Some(arguments) = arguments {
            args.extend(arguments.split_whitespace().map(str::to_string));
        }
        (program, args)
    }
}

pub fn find_host(name: &str) -> Option<&'static ScriptHost> {
    HOSTS.iter().find(|host| host.name == name)
}

/// Pick the script to run from a job directory's top-level files
pub fn find_command_to_run(files: &[PathBuf]) -> Option<(PathBuf, &'static ScriptHost)> {
    let is_run_file = |path: &PathBuf| {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem.eq_ignore_ascii_case("run"))
    };

    for host in HOSTS {
        if let Some(file) = files.iter().find(|f| is_run_file(f) && host.supports(f)) {
            return Some((file.clone(), host));
        }
    }

    let mut sorted: Vec<&PathBuf> = files.iter().collect();
    sorted.sort();
    for host in HOSTS {
        if let Some(file) = sorted.iter().find(|f| host.supports(f)) {
            return Some(((*file).clone(), host));
        }
    }
    None
}
