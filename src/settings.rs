use crate::{*, error::*, log::*};
use std::{fs, sync::OnceLock};

// Agent configuration, parsed from the whitespace-split contents of
// ROCM_DEBUG_AGENT_OPTIONS at load time.

#[derive(Clone, Debug)]
pub struct Settings {
    pub all_wavefronts: bool,
    pub disable_linux_signals: bool,
    pub precise_memory: bool,
    pub log_level: LogLevel,
    pub output: Option<String>,
    pub save_code_objects: Option<String>,
}

impl Default for Settings {
    fn default() -> Self { Settings {
        all_wavefronts: false,
        disable_linux_signals: false,
        precise_memory: false,
        log_level: LogLevel::Warning,
        output: None,
        save_code_objects: None,
    } }
}

static SETTINGS: OnceLock<Settings> = OnceLock::new();

// Called once from bootstrap, before the worker starts.
pub fn set_global(settings: Settings) {
    let _ = SETTINGS.set(settings);
}

pub fn global() -> &'static Settings {
    SETTINGS.get_or_init(Settings::default)
}

impl Settings {
    // Usage errors come back as Err; the bootstrap prints usage and aborts on them.
    pub fn parse(args: &[String]) -> Result<Settings> {
        let mut settings = Settings::default();
        let mut i = 0;
        while i < args.len() {
            let arg = args[i].clone();
            i += 1;

            let (name, inline_value) = match arg.split_once('=') {
                Some((n, v)) if n.starts_with("--") => (n.to_string(), Some(v.to_string())),
                _ => (arg.clone(), None),
            };

            match &name[..] {
                "-a" | "--all" => {
                    reject_value(&name, &inline_value)?;
                    settings.all_wavefronts = true;
                }
                "-d" | "--disable-linux-signals" => {
                    reject_value(&name, &inline_value)?;
                    settings.disable_linux_signals = true;
                }
                "-p" | "--precise-memory" => {
                    reject_value(&name, &inline_value)?;
                    settings.precise_memory = true;
                }
                "-l" | "--log-level" => {
                    let value = take_required(args, &mut i, inline_value, &name)?;
                    settings.log_level = match &value[..] {
                        "none" => LogLevel::None,
                        "error" => LogLevel::Error,
                        "warning" => LogLevel::Warning,
                        "info" => LogLevel::Info,
                        "verbose" => LogLevel::Verbose,
                        _ => return err!(Usage, "invalid log level `{}'", value),
                    };
                }
                "-o" | "--output" => {
                    settings.output = Some(take_required(args, &mut i, inline_value, &name)?);
                }
                "-s" | "--save-code-objects" => {
                    let dir = take_optional(args, &mut i, inline_value).unwrap_or_else(|| ".".to_string());
                    match fs::metadata(&dir) {
                        Ok(m) if m.is_dir() => (),
                        _ => return err!(Usage, "cannot access code object save directory `{}'", dir),
                    }
                    settings.save_code_objects = Some(dir);
                }
                "-h" | "--help" => return err!(Usage, ""),
                _ => return err!(Usage, "unrecognized option `{}'", arg),
            }
        }
        Ok(settings)
    }
}

fn reject_value(name: &str, inline_value: &Option<String>) -> Result<()> {
    if inline_value.is_some() {
        return err!(Usage, "option `{}' doesn't accept a value", name);
    }
    Ok(())
}

fn take_required(args: &[String], i: &mut usize, inline_value: Option<String>, name: &str) -> Result<String> {
    if let Some(v) = inline_value {
        return Ok(v);
    }
    if *i < args.len() {
        let v = args[*i].clone();
        *i += 1;
        return Ok(v);
    }
    err!(Usage, "option `{}' requires an argument", name)
}

// An optional argument is consumed only if the next token doesn't look like an option.
fn take_optional(args: &[String], i: &mut usize, inline_value: Option<String>) -> Option<String> {
    if inline_value.is_some() {
        return inline_value;
    }
    if *i < args.len() && !args[*i].starts_with('-') {
        let v = args[*i].clone();
        *i += 1;
        return Some(v);
    }
    None
}

pub fn print_usage() {
    eprintln!("gpu-debug-agent usage (ROCM_DEBUG_AGENT_OPTIONS):");
    eprintln!("  -a, --all                   Print all wavefronts.");
    eprintln!("  -s, --save-code-objects[=DIR]   Save all loaded code objects. If the directory");
    eprintln!("                              is not specified, the code objects are saved in");
    eprintln!("                              the current directory.");
    eprintln!("  -p, --precise-memory        Enable precise memory mode, which ensures that");
    eprintln!("                              when an exception is reported, the PC points to");
    eprintln!("                              the instruction immediately after the one that");
    eprintln!("                              caused the exception.");
    eprintln!("  -o, --output=FILE           Save the output in FILE. By default, the output");
    eprintln!("                              is redirected to stderr.");
    eprintln!("  -d, --disable-linux-signals Disable installing a SIGQUIT signal handler, so");
    eprintln!("                              that the default Linux handler may dump a core");
    eprintln!("                              file.");
    eprintln!("  -l, --log-level={{none|error|warning|info|verbose}}");
    eprintln!("                              Change the log level. The default is 'warning'.");
    eprintln!("  -h, --help                  Display a usage message and abort the process.");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flags() {
        let s = Settings::parse(&args(&["-a", "--precise-memory", "-d"])).unwrap();
        assert!(s.all_wavefronts && s.precise_memory && s.disable_linux_signals);
        assert!(s.output.is_none() && s.save_code_objects.is_none());
    }

    #[test]
    fn log_levels() {
        let s = Settings::parse(&args(&["-l", "info"])).unwrap();
        assert_eq!(s.log_level, LogLevel::Info);
        let s = Settings::parse(&args(&["--log-level=verbose"])).unwrap();
        assert_eq!(s.log_level, LogLevel::Verbose);
        assert!(Settings::parse(&args(&["-l", "nope"])).unwrap_err().is_usage());
        assert!(Settings::parse(&args(&["-l"])).unwrap_err().is_usage());
    }

    #[test]
    fn save_code_objects_argument_is_optional() {
        let s = Settings::parse(&args(&["-s"])).unwrap();
        assert_eq!(s.save_code_objects.as_deref(), Some("."));

        let tmp = std::env::temp_dir();
        let s = Settings::parse(&args(&["-s", tmp.to_str().unwrap()])).unwrap();
        assert_eq!(s.save_code_objects.as_deref(), tmp.to_str());

        // A following option is not consumed as the directory.
        let s = Settings::parse(&args(&["-s", "-a"])).unwrap();
        assert_eq!(s.save_code_objects.as_deref(), Some("."));
        assert!(s.all_wavefronts);

        assert!(Settings::parse(&args(&["-s", "/no/such/directory"])).unwrap_err().is_usage());
    }

    #[test]
    fn output_requires_argument() {
        let s = Settings::parse(&args(&["--output=/tmp/report.txt"])).unwrap();
        assert_eq!(s.output.as_deref(), Some("/tmp/report.txt"));
        assert!(Settings::parse(&args(&["-o"])).unwrap_err().is_usage());
    }

    #[test]
    fn unknown_options_and_help() {
        assert!(Settings::parse(&args(&["-z"])).unwrap_err().is_usage());
        assert!(Settings::parse(&args(&["--frobnicate"])).unwrap_err().is_usage());
        assert!(Settings::parse(&args(&["-h"])).unwrap_err().is_usage());
        assert!(Settings::parse(&args(&["--all=yes"])).unwrap_err().is_usage());
    }
}
