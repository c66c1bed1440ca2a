//! Minimal `{{ .Field }}` substitution for task commands and output name
//! patterns. Unknown fields fail the render instead of being dropped.

use anyhow::{bail, Result};

use crate::models::{Data, Task};

/// Variables available to task command/args templates. Filled by the
/// runner immediately before a task is launched.
#[derive(Debug, Clone, Default)]
pub struct CommandVars {
    pub server_address_v4: String,
    pub server_address_v6: String,
    pub server_port: u16,
}

impl CommandVars {
    fn lookup(&self, field: &str) -> Option<String> {
        match field {
            "ServerAddressV4" => Some(self.server_address_v4.clone()),
            "ServerAddressV6" => Some(self.server_address_v6.clone()),
            "ServerPort" => Some(self.server_port.to_string()),
            _ => None,
        }
    }
}

/// Render `task.command` and every entry of `task.args` in place
pub fn template_task(task: &mut Task, vars: &CommandVars) -> Result<()> {
    task.command = render(&task.command, &|field| vars.lookup(field))?;
    let mut args = Vec::with_capacity(task.args.len());
    for arg in &task.args {
        args.push(render(arg, &|field| vars.lookup(field))?);
    }
    task.args = args;
    Ok(())
}

/// Render a file/table name pattern against a [`Data`] frame
pub fn render_name_pattern(pattern: &str, data: &Data) -> Result<String> {
    render(pattern, &|field| match field {
        "UnixTime" => Some(data.test_start_time.timestamp().to_string()),
        "Data.Tester" => Some(data.tester.clone()),
        "Data.ServerHost" => Some(data.server_host.clone()),
        "Data.ClientHost" => Some(data.client_host.clone()),
        _ => None,
    })
}

/// Substitute every `{{ .Field }}` occurrence using `lookup`. Whitespace
/// inside the braces is ignored; a field `lookup` does not know is an
/// error, as is an unterminated placeholder.
pub fn render(input: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            bail!("unterminated template placeholder in {input:?}");
        };

        let inner = after[..end].trim();
        let Some(field) = inner.strip_prefix('.') else {
            bail!("malformed template placeholder {{{{{inner}}}}} in {input:?}");
        };
        match lookup(field) {
            Some(value) => out.push_str(&value),
            None => bail!("unknown template variable {field:?} in {input:?}"),
        }

        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}
