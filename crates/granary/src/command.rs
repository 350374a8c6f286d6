//! The command plane.
//!
//! The host writes newline-terminated command lines to a character device;
//! the device itself is the host's concern — this module owns the state
//! machine behind it. Recognised commands are `init <options>`, `attach`,
//! `detach` and `exit`, each idempotent with respect to its pre-condition:
//! a second `init` is a no-op, `attach` before `init` is ignored, and so
//! on.

use std::sync::Mutex;

use crate::options::Options;

/// One parsed command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Initialise with the given options.
    Init(Options),
    /// Begin translating.
    Attach,
    /// Stop translating; native code runs natively again.
    Detach,
    /// Tear everything down.
    Exit,
}

/// Parse one newline-terminated command line. Unknown commands parse to
/// `None` and are dropped by the plane.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim_end_matches('\n').trim();
    if let Some(rest) = line.strip_prefix("init") {
        if rest.is_empty() || rest.starts_with(' ') {
            return Some(Command::Init(Options::parse(rest)));
        }
        return None;
    }
    match line {
        "attach" => Some(Command::Attach),
        "detach" => Some(Command::Detach),
        "exit" => Some(Command::Exit),
        _ => None,
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
enum PlaneState {
    #[default]
    Fresh,
    Initialized,
    Attached,
}

/// The command-plane state machine.
#[derive(Debug, Default)]
pub struct CommandPlane {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: PlaneState,
    options: Options,
}

impl CommandPlane {
    /// A fresh, uninitialised plane.
    pub fn new() -> CommandPlane {
        CommandPlane::default()
    }

    /// Handle one command line. Returns whether the line changed the
    /// plane's state (idempotent re-issues and unknown commands do not).
    pub fn handle_command_line(&self, line: &str) -> bool {
        let Some(command) = parse_command(line) else {
            log::debug!("ignoring unknown command line: {line:?}");
            return false;
        };
        let mut inner = self.inner.lock().unwrap();
        match (command, &inner.state) {
            (Command::Init(options), PlaneState::Fresh) => {
                inner.options = options;
                inner.state = PlaneState::Initialized;
                log::info!("initialised");
                true
            }
            (Command::Attach, PlaneState::Initialized) => {
                inner.state = PlaneState::Attached;
                log::info!("attached");
                true
            }
            (Command::Detach, PlaneState::Attached) => {
                inner.state = PlaneState::Initialized;
                log::info!("detached");
                true
            }
            // Exit requires an initialised, detached plane, and returns it
            // to its boot state so a later init starts a fresh cycle.
            (Command::Exit, PlaneState::Initialized) => {
                inner.state = PlaneState::Fresh;
                log::info!("exited");
                true
            }
            // Every other pairing violates its pre-condition and is a
            // no-op.
            _ => false,
        }
    }

    /// Is the plane currently translating?
    pub fn is_attached(&self) -> bool {
        self.inner.lock().unwrap().state == PlaneState::Attached
    }

    /// Has `init` run?
    pub fn is_initialized(&self) -> bool {
        !matches!(self.inner.lock().unwrap().state, PlaneState::Fresh)
    }

    /// The options `init` carried.
    pub fn options(&self) -> Options {
        self.inner.lock().unwrap().options.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle() {
        let plane = CommandPlane::new();
        assert!(!plane.is_initialized());
        assert!(plane.handle_command_line("init --count_blocks\n"));
        assert!(plane.is_initialized());
        assert!(plane.options().flag("count_blocks").unwrap());

        assert!(plane.handle_command_line("attach"));
        assert!(plane.is_attached());
        assert!(plane.handle_command_line("detach"));
        assert!(!plane.is_attached());
        assert!(plane.handle_command_line("attach"));

        // Exit while still attached is a no-op; detach must come first.
        assert!(!plane.handle_command_line("exit"));
        assert!(plane.is_attached());
        assert!(plane.handle_command_line("detach"));
        assert!(plane.handle_command_line("exit"));
        assert!(!plane.is_attached());
        assert!(!plane.is_initialized());
    }

    #[test]
    fn commands_are_idempotent() {
        let plane = CommandPlane::new();
        assert!(plane.handle_command_line("init"));
        // A second init is a no-op, even with different options.
        assert!(!plane.handle_command_line("init --other"));
        assert!(plane.options().is_empty());

        assert!(plane.handle_command_line("attach"));
        assert!(!plane.handle_command_line("attach"));
        assert!(plane.handle_command_line("detach"));
        assert!(plane.handle_command_line("exit"));
        assert!(!plane.handle_command_line("exit"));
    }

    #[test]
    fn preconditions_gate_transitions() {
        let plane = CommandPlane::new();
        // Attach before init is ignored, and so is exit.
        assert!(!plane.handle_command_line("attach"));
        assert!(!plane.is_attached());
        assert!(!plane.handle_command_line("exit"));
        // Detach while not attached is ignored.
        assert!(plane.handle_command_line("init"));
        assert!(!plane.handle_command_line("detach"));
    }

    #[test]
    fn exit_returns_the_plane_to_its_boot_state() {
        let plane = CommandPlane::new();
        assert!(plane.handle_command_line("init --count_blocks"));
        assert!(plane.handle_command_line("exit"));
        assert!(!plane.is_initialized());

        // A fresh init/attach/detach/exit cycle starts over.
        assert!(plane.handle_command_line("init"));
        assert!(plane.is_initialized());
        assert!(plane.handle_command_line("attach"));
        assert!(plane.handle_command_line("detach"));
        assert!(plane.handle_command_line("exit"));
    }

    #[test]
    fn unknown_lines_are_dropped() {
        let plane = CommandPlane::new();
        assert!(!plane.handle_command_line("initialise"));
        assert!(!plane.handle_command_line("frobnicate --x"));
        assert!(!plane.is_initialized());
    }
}
