//! Reference documentation rendered from the clap command definition.

use clap::{Arg, ArgAction, Command};

/// One visible option, flattened out of clap's builder types.
struct OptionDoc {
    flag: String,
    value: Option<String>,
    repeatable: bool,
    help: String,
}

fn options(cmd: &Command) -> Vec<OptionDoc> {
    cmd.get_arguments()
        .filter(|arg| !arg.is_hide_set() && !arg.is_positional())
        .filter_map(|arg| {
            let long = arg.get_long()?;
            Some(OptionDoc {
                flag: format!("--{long}"),
                value: value_name(arg),
                repeatable: matches!(arg.get_action(), ArgAction::Append),
                help: arg.get_help().map(|h| h.to_string()).unwrap_or_default(),
            })
        })
        .collect()
}

fn value_name(arg: &Arg) -> Option<String> {
    if !arg.get_action().takes_values() {
        return None;
    }
    let name = arg
        .get_value_names()
        .and_then(|names| names.first())
        .map(|n| n.to_string())
        .unwrap_or_else(|| arg.get_id().to_string().to_uppercase());
    Some(name)
}

fn about(cmd: &Command) -> String {
    cmd.get_about().map(|a| a.to_string()).unwrap_or_default()
}

// -----------------------------------------------------------------------
// roff
// -----------------------------------------------------------------------

fn roff_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('-', "\\-")
}

/// Escape running text. A line starting with `.` or `'` would be read as
/// a request, so it gets a zero-width `\&` in front.
fn roff_text(text: &str) -> String {
    roff_escape(text)
        .lines()
        .map(|line| {
            if line.starts_with('.') || line.starts_with('\'') {
                format!("\\&{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render a section 8 man page.
pub fn man_page(cmd: &Command) -> String {
    let name = cmd.get_name();
    let version = cmd.get_version().unwrap_or_default();
    let mut out = String::new();

    out.push_str(&format!(
        ".TH {} 8 \"\" \"{name} {version}\" \"System Administration\"\n",
        name.to_uppercase()
    ));
    out.push_str(".SH NAME\n");
    out.push_str(&format!("{} \\- {}\n", roff_escape(name), roff_escape(&about(cmd))));
    out.push_str(".SH SYNOPSIS\n");
    out.push_str(&format!(".B {}\n[\\fIOPTIONS\\fR]\n", roff_escape(name)));
    out.push_str(".SH OPTIONS\n");
    for opt in options(cmd) {
        out.push_str(".TP\n");
        out.push_str(&format!("\\fB{}\\fR", roff_escape(&opt.flag)));
        if let Some(value) = &opt.value {
            out.push_str(&format!(" \\fI{}\\fR", roff_escape(value)));
        }
        out.push('\n');
        out.push_str(&roff_text(&opt.help));
        if opt.repeatable {
            out.push_str(" May be given more than once.");
        }
        out.push('\n');
    }
    out.push_str(".SH FILES\n.TP\n");
    out.push_str(&roff_escape("~/.config/relayd/config.toml"));
    out.push_str("\nDefault configuration file.\n");
    out
}

// -----------------------------------------------------------------------
// Markdown
// -----------------------------------------------------------------------

/// Render a Markdown reference page.
pub fn markdown(cmd: &Command) -> String {
    let name = cmd.get_name();
    let mut out = format!("# {name}\n\n{}\n\n", about(cmd));
    out.push_str(&format!("```\n{name} [OPTIONS]\n```\n\n## Options\n\n"));
    for opt in options(cmd) {
        let usage = match &opt.value {
            Some(value) => format!("{} <{value}>", opt.flag),
            None => opt.flag.clone(),
        };
        out.push_str(&format!("- `{usage}`: {}", opt.help));
        if opt.repeatable {
            out.push_str(" (repeatable)");
        }
        out.push('\n');
    }
    out
}
