use anyhow::{Context, bail};
use std::path::{Path, PathBuf};
use std::process::Command;

static ARGS_FILE: &str = "args";
static EXPECTED_STDOUT_FILE: &str = "expected-stdout";
static EXPECTED_FAILURE_FILE: &str = "expected-failure";

/// A directory under `golden-tests/tests` holding the workbench's arguments and its expected
/// output
///
/// A missing `expected-stdout` is recorded from the current run. A case with an
/// `expected-failure` file must exit unsuccessfully (and its stdout is still compared).
struct GoldenCase {
    dir: PathBuf,
    args: String,
    expected_stdout: Option<String>,
    should_fail: bool,
}

impl GoldenCase {
    fn load(dir: PathBuf) -> anyhow::Result<Self> {
        let args_path = dir.join(ARGS_FILE);
        let args = std::fs::read_to_string(&args_path)
            .with_context(|| format!("no `{ARGS_FILE}` file found at `{}`", args_path.display()))?;

        let stdout_path = dir.join(EXPECTED_STDOUT_FILE);
        let expected_stdout = if stdout_path.is_file() {
            Some(
                std::fs::read_to_string(&stdout_path)
                    .with_context(|| format!("failed to read `{}`", stdout_path.display()))?,
            )
        } else {
            None
        };

        Ok(Self {
            should_fail: dir.join(EXPECTED_FAILURE_FILE).is_file(),
            dir,
            args,
            expected_stdout,
        })
    }

    fn name(&self) -> String {
        self.dir.display().to_string()
    }
}

fn main() -> anyhow::Result<()> {
    let mut cases = Vec::new();
    let dirs =
        std::fs::read_dir("golden-tests/tests").context("golden tests root directory not found")?;
    for entry in dirs {
        let path = entry?.path();
        if !path.is_dir() {
            println!("skipping `{}`: not a directory", path.display());
            continue;
        }

        cases.push(GoldenCase::load(path)?);
    }
    cases.sort_by(|a, b| a.dir.cmp(&b.dir));

    let mut errored = false;
    for case in cases {
        let name = case.name();
        match run_workbench(&case) {
            Ok(()) => println!("{name}: ✅"),
            Err(GoldenError::Internal(e)) => {
                println!("Error running golden test `{name}`");
                println!("{e:?}");
                errored = true;
            }
            Err(GoldenError::StdoutDiffers(diff)) => {
                println!("Error running golden test `{name}`");
                println!("Expected stdout differs from actual stdout:\n{diff}");
                errored = true;
            }
        }
    }

    if errored {
        bail!("one or more golden tests failed");
    }

    Ok(())
}

enum GoldenError {
    Internal(anyhow::Error),
    StdoutDiffers(String),
}

fn run_workbench(case: &GoldenCase) -> Result<(), GoldenError> {
    let output = Command::new("cargo")
        .arg("run")
        .arg("--release")
        .arg("--bin")
        .arg("flood-workbench")
        .arg("--")
        .args(case.args.split_whitespace())
        .output()
        .context("flood-workbench process crashed")
        .map_err(GoldenError::Internal)?;

    if output.status.success() == case.should_fail {
        return Err(GoldenError::Internal(anyhow::anyhow!(
            "unexpected exit status ({}), stderr:\n{}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match &case.expected_stdout {
        Some(expected) if *expected != stdout => {
            Err(GoldenError::StdoutDiffers(diff::diff_to_string(expected, &stdout)))
        }
        Some(_) => Ok(()),
        None => record(&case.dir, &stdout).map_err(GoldenError::Internal),
    }
}

fn record(dir: &Path, stdout: &str) -> anyhow::Result<()> {
    std::fs::write(dir.join(EXPECTED_STDOUT_FILE), stdout.as_bytes())
        .context("failed to persist stdout")
}

mod diff {
    use console::{Style, style};
    use similar::{ChangeTag, TextDiff};
    use std::fmt::{self, Write};

    struct Line(Option<usize>);

    impl fmt::Display for Line {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            match self.0 {
                None => write!(f, "    "),
                Some(idx) => write!(f, "{:<4}", idx + 1),
            }
        }
    }

    pub fn diff_to_string(old: &str, new: &str) -> String {
        let mut output = String::new();
        let diff = TextDiff::from_lines(old, new);

        for (idx, group) in diff.grouped_ops(3).iter().enumerate() {
            if idx > 0 {
                _ = writeln!(output, "{:-^1$}", "-", 80);
            }
            for op in group {
                for change in diff.iter_inline_changes(op) {
                    let (sign, s) = match change.tag() {
                        ChangeTag::Delete => ("-", Style::new().red()),
                        ChangeTag::Insert => ("+", Style::new().green()),
                        ChangeTag::Equal => (" ", Style::new().dim()),
                    };
                    _ = write!(
                        output,
                        "{}{} |{}",
                        style(Line(change.old_index())).dim(),
                        style(Line(change.new_index())).dim(),
                        s.apply_to(sign).bold(),
                    );
                    for (emphasized, value) in change.iter_strings_lossy() {
                        if emphasized {
                            _ = write!(output, "{}", s.apply_to(value).underlined().on_black());
                        } else {
                            _ = write!(output, "{}", s.apply_to(value));
                        }
                    }
                    if change.missing_newline() {
                        _ = writeln!(output);
                    }
                }
            }
        }

        output
    }
}
