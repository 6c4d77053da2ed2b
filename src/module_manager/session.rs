use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
};

use tracing::{debug, info, warn};

use crate::{command::CommandRunner, config_manager::Config};

// Display servers to look for, in order
const DISPLAY_SERVERS: [&str; 2] = ["Xwayland", "Xorg"];

// Only sessions owned by the display manager account are killed
const DISPLAY_MANAGER_USER: &str = "gdm";

// Finds and kills the display session started by the display manager
pub struct DisplaySession<'a> {
    runner: &'a dyn CommandRunner,
    proc_dir: PathBuf,
    passwd: PathBuf,
    dry_run: bool,
}

impl<'a> DisplaySession<'a> {
    pub fn new(config: &Config, runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            proc_dir: config.system.proc_dir.clone(),
            passwd: config.system.passwd.clone(),
            dry_run: config.dry_run,
        }
    }

    // Kill the main display session. Returns true if the kill was
    // delivered (always true in a dry run)
    pub fn kill_main_session(&self) -> bool {
        if self.dry_run {
            info!("Dry run: not killing the display session");
            return true;
        }

        let Some((server, pid)) = DISPLAY_SERVERS
            .iter()
            .find_map(|server| self.session_pid(server).map(|pid| (server, pid)))
        else {
            info!("No display manager session found");
            return false;
        };

        info!("Killing {server} with PID {pid}");

        let pid = pid.to_string();
        match self.runner.status("/bin/kill", &["-KILL", &pid]) {
            Ok(killed) => killed,
            Err(err) => {
                warn!("Failed to kill {pid}: {err:#}");
                false
            }
        }
    }

    // Return the PID of the given display server if it runs as the
    // display manager user
    fn session_pid(&self, server: &str) -> Option<u32> {
        let pids = match self.runner.first_line("/bin/pidof", &[server]) {
            Ok(Some(pids)) => pids,
            Ok(None) => {
                info!("No PID found for {server}");
                return None;
            }
            Err(err) => {
                warn!("Failed to look for {server}: {err:#}");
                return None;
            }
        };

        info!("Found PID(s) {pids} for {server}");

        pids.split_whitespace()
            .filter_map(|pid| pid.parse::<u32>().ok())
            .find(|pid| {
                let Some(uid) = self.uid_of_pid(*pid) else {
                    return false;
                };
                let user = self.user_of_uid(uid);

                debug!("PID {pid} belongs to {user:?} (UID {uid})");

                user.as_deref() == Some(DISPLAY_MANAGER_USER)
            })
    }

    // Real UID of a process, from the "Uid:" line of its status file
    fn uid_of_pid(&self, pid: u32) -> Option<u32> {
        let path = self.proc_dir.join(pid.to_string()).join("status");

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) => {
                debug!("Can't open {path:?}: {err}");
                return None;
            }
        };

        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .find_map(|line| {
                line.strip_prefix("Uid:")?
                    .split_whitespace()
                    .next()?
                    .parse()
                    .ok()
            })
    }

    // Name of the user with the given UID
    fn user_of_uid(&self, uid: u32) -> Option<String> {
        let file = File::open(&self.passwd).ok()?;
        let uid = uid.to_string();

        // name:password:uid:gid:gecos:home:shell
        BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .find_map(|line| {
                let mut fields = line.split(':');
                let name = fields.next()?;

                (fields.nth(1)? == uid).then(|| name.to_string())
            })
    }
}
