use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    process::{Command, Stdio},
};

use anyhow::{Context, Result};
use tracing::{debug, trace};

// Blocking execution of external programs. No timeout is applied,
// a hung program hangs the caller
pub trait CommandRunner {
    // Run a program and report whether it exited successfully
    fn status(&self, program: &str, args: &[&str]) -> Result<bool>;

    // Run a program and return the first line of its standard output
    fn first_line(&self, program: &str, args: &[&str]) -> Result<Option<String>>;
}

// Runs the programs on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn status(&self, program: &str, args: &[&str]) -> Result<bool> {
        debug!("Calling {}", command_line(program, args));

        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("Failed to run {program}"))?;

        Ok(status.success())
    }

    fn first_line(&self, program: &str, args: &[&str]) -> Result<Option<String>> {
        debug!("Calling {}", command_line(program, args));

        let output = Command::new(program)
            .args(args)
            .stderr(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run {program}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next().map(str::to_string);

        trace!("{program} answered {line:?}");

        Ok(line)
    }
}

// Runner with canned answers that records every command line.
// Commands succeed and print nothing unless told otherwise
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    calls: RefCell<Vec<String>>,
    failures: HashSet<String>,
    outputs: HashMap<String, String>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    // Make the given command line exit with a failure
    pub fn fail(mut self, command_line: &str) -> Self {
        self.failures.insert(command_line.to_string());
        self
    }

    // Make the given command line print a line
    pub fn reply(mut self, command_line: &str, output: &str) -> Self {
        self.outputs
            .insert(command_line.to_string(), output.to_string());
        self
    }

    // Every command line run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    // Number of times a command line was run
    pub fn count(&self, command_line: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|call| *call == command_line)
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn status(&self, program: &str, args: &[&str]) -> Result<bool> {
        let line = command_line(program, args);
        let success = !self.failures.contains(&line);

        self.calls.borrow_mut().push(line);

        Ok(success)
    }

    fn first_line(&self, program: &str, args: &[&str]) -> Result<Option<String>> {
        let line = command_line(program, args);
        let output = self.outputs.get(&line).cloned();

        self.calls.borrow_mut().push(line);

        Ok(output)
    }
}

pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_runner_records_and_answers() {
        let runner = ScriptedRunner::new()
            .fail("/sbin/rmmod nvidia")
            .reply("/bin/pidof Xorg", "1234 5678");

        assert!(!runner.status("/sbin/rmmod", &["nvidia"]).unwrap());
        assert!(runner.status("/sbin/modprobe", &["nvidia"]).unwrap());
        assert_eq!(
            runner.first_line("/bin/pidof", &["Xorg"]).unwrap().as_deref(),
            Some("1234 5678")
        );
        assert_eq!(runner.first_line("/bin/pidof", &["Xwayland"]).unwrap(), None);

        assert_eq!(runner.calls().len(), 4);
        assert_eq!(runner.count("/sbin/rmmod nvidia"), 1);
    }

    #[test]
    fn system_runner_reads_the_first_line() {
        let runner = SystemRunner;

        let line = runner.first_line("/bin/sh", &["-c", "echo one; echo two"]);

        assert_eq!(line.unwrap().as_deref(), Some("one"));
        assert!(!runner.status("/bin/sh", &["-c", "exit 3"]).unwrap());
    }
}
