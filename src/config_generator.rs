//! Icinga2 `CheckCommand` configuration generated from the clap definition,
//! so the object in the monitoring config never drifts from the actual CLI.

use clap::ArgAction;

#[derive(Debug, thiserror::Error)]
pub enum IcingaConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("executable path is not valid UTF-8")]
    InvalidExecutablePath,
    #[error("argument {0:?} has no long form")]
    MissingLongForm(String),
}

/// The argument surface of the plugin, extracted from clap.
pub struct IcingaCommand {
    arguments: Vec<IcingaArgument>,
}

struct IcingaArgument {
    long: String,
    variable: String,
    help: Option<String>,
    is_flag: bool,
    default: Option<String>,
}

impl IcingaCommand {
    pub fn from_clap(cmd: &clap::Command) -> Result<Self, IcingaConfigError> {
        let mut arguments = Vec::new();

        for arg in cmd.get_arguments() {
            let long = arg
                .get_long()
                .ok_or_else(|| IcingaConfigError::MissingLongForm(arg.get_id().to_string()))?
                .to_owned();

            let variable = long.replace('-', "_");
            let help = arg.get_help().map(|help| help.to_string());

            // Flags become set_if entries; everything else takes a value.
            let is_flag = matches!(arg.get_action(), ArgAction::SetTrue | ArgAction::Count);

            let default = arg
                .get_default_values()
                .first()
                .and_then(|value| value.to_str())
                .map(|value| value.to_owned());

            arguments.push(IcingaArgument {
                long,
                variable,
                help,
                is_flag,
                default,
            });
        }

        Ok(IcingaCommand { arguments })
    }

    /// Renders an `object CheckCommand` block pointing at the running
    /// executable.
    pub fn render(&self, name: &str) -> Result<String, IcingaConfigError> {
        let exe = std::env::current_exe()?
            .to_str()
            .ok_or(IcingaConfigError::InvalidExecutablePath)?
            .to_owned();

        Ok(self.render_for_exe(name, &exe))
    }

    fn render_for_exe(&self, name: &str, exe: &str) -> String {
        let mut out = format!("object CheckCommand \"{name}\" {{\n");
        out.push_str(&format!("  command = [ \"{exe}\" ]\n"));
        out.push_str("  arguments = {\n");

        for arg in &self.arguments {
            out.push_str(&format!("  \"--{}\" = {{\n", arg.long));

            if arg.is_flag {
                out.push_str(&format!("    set_if = \"${}$\"\n", arg.variable));
            } else {
                out.push_str(&format!("    value = \"${}$\"\n", arg.variable));
            }

            if let Some(ref help) = arg.help {
                out.push_str(&format!("    description = \"{}\"\n", escape(help)));
            }

            out.push_str("  }\n");
        }

        out.push('\n');

        for arg in &self.arguments {
            if let Some(ref default) = arg.default {
                out.push_str(&format!(
                    "  vars.{} = \"{}\"\n",
                    arg.variable,
                    escape(default)
                ));
            }
        }

        out.push_str("}\n");
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
}

/// Prints the Icinga command configuration and exits if the
/// GENERATE_ICINGA_COMMAND environment variable is set.
pub fn print_icinga_command_if_requested(
    name: &str,
    cmd: &clap::Command,
) -> Result<(), IcingaConfigError> {
    if std::env::var_os("GENERATE_ICINGA_COMMAND").is_none() {
        return Ok(());
    }

    let out = IcingaCommand::from_clap(cmd)?.render(name)?;

    println!("{}", out.trim());
    std::process::exit(0);
}
