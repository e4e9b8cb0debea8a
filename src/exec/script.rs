/// Utility for building the contents of a `command.sh` script file.
/// Note that it modifies a String reference held internally;
/// read that String to get the script's contents.
///
/// Locally the script is only a record of what was run; batch backends submit it.
#[derive(Debug)]
pub struct CommandScriptBuilder<'a> {
    strbuf: &'a mut String,
}

impl<'a> CommandScriptBuilder<'a> {
    pub fn new(strbuf: &'a mut String) -> Self {
        Self { strbuf }
    }
}

impl CommandScriptBuilder<'_> {
    /// shebang line and bash options
    pub fn write_prefix(&mut self, node: &str) {
        self.strbuf.clear();
        self.strbuf.push_str("#!/usr/bin/env bash\nset -uo pipefail\n\n# ");
        self.strbuf.push_str(node);
        self.strbuf.push('\n');
    }

    /// cd to the node's working directory
    pub fn write_cd(&mut self, dir: &str) {
        self.strbuf.push_str("cd ");
        self.strbuf.push_str(&quote(dir));
        self.strbuf.push('\n');
    }

    /// a single exported variable
    pub fn write_export(&mut self, var_name: &str, var_val: &str) {
        self.strbuf.push_str("export ");
        self.strbuf.push_str(var_name);
        self.strbuf.push('=');
        self.strbuf.push_str(&quote(var_val));
        self.strbuf.push('\n');
    }

    /// remove a stale output path before running
    pub fn write_remove(&mut self, path: &str) {
        self.strbuf.push_str("rm -rf ");
        self.strbuf.push_str(&quote(path));
        self.strbuf.push('\n');
    }

    /// the command line itself, then record its exit code and exit with it.
    pub fn write_command(&mut self, program: &str, args: &[String]) {
        self.strbuf.push('\n');
        self.strbuf.push_str(&quote(program));
        for arg in args {
            self.strbuf.push(' ');
            self.strbuf.push_str(&quote(arg));
        }
        self.strbuf.push_str("\ncode=$?\necho $code > exit_code\nexit $code\n");
    }
}

/// Single-quote `s` for the shell unless it only contains safe characters.
pub fn quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        s.to_owned()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}
