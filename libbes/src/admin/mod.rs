// Copyright 2024 BES Project Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The admin XML-over-PPT command handler (spec §4.7). Consumes a single
//! `BesAdminCmd` document per invocation, processes its children in
//! document order, and produces `hai:`-namespaced response XML.
//!
//! The command lookup is a closed tagged union (`AdminCommand`), per the
//! spec's Design Notes instruction to replace the original's
//! string-keyed `hai_command` enum with something exhaustively checked.

mod config_registry;
mod log_tail;
mod xml;

use quick_xml::{events::Event, Reader};

pub use config_registry::ConfigRegistry;
pub use log_tail::tail_lines;

use crate::error::BesError;

/// What the supervisor exposes to the admin handler. A trait so the admin
/// layer can be tested without a real process tree.
pub trait SupervisorControl {
    fn is_master_running(&self) -> bool;
    fn stop_master(&mut self) -> anyhow::Result<()>;
    fn start_master(&mut self) -> anyhow::Result<()>;
}

/// The debug-context registry: named contexts and their on/off state.
#[derive(Default, Debug, Clone)]
pub struct DebugContexts {
    contexts: std::collections::BTreeMap<String, bool>,
}

impl DebugContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_spec(spec: &str) -> Self {
        let mut contexts = std::collections::BTreeMap::new();
        for name in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            contexts.insert(name.to_string(), true);
        }
        DebugContexts { contexts }
    }

    pub fn set(&mut self, name: &str, on: bool) {
        self.contexts.insert(name.to_string(), on);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.contexts.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// The wire-level disposition a processed document should be reported with
/// on the PPT session, independent of the `hai:` XML body itself: `Ok` sends
/// no extensions, `Error` adds `status=error`, `Fatal` additionally adds
/// `exit=true` (spec §4.7/§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Error,
    Fatal,
}

impl ResponseStatus {
    fn escalate(self, other: ResponseStatus) -> ResponseStatus {
        use ResponseStatus::*;
        match (self, other) {
            (Fatal, _) | (_, Fatal) => Fatal,
            (Error, _) | (_, Error) => Error,
            (Ok, Ok) => Ok,
        }
    }
}

fn status_for_error_kind(kind: &str) -> ResponseStatus {
    if kind == "InternalFatal" {
        ResponseStatus::Fatal
    } else {
        ResponseStatus::Error
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AdminCommand {
    StopNow,
    Start,
    Exit,
    GetConfig,
    SetConfig { module: String, contents: String },
    TailLog { lines: i64 },
    GetLogContexts,
    SetLogContext { name: String, state: String },
    Unknown { name: String },
}

/// Parses a `BesAdminCmd` document into its ordered list of commands.
fn parse_commands(xml: &str) -> Result<Vec<AdminCommand>, BesError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut commands = Vec::new();
    let mut saw_root = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Eof) => break,
            Ok(Event::Empty(e)) => {
                let name = local_name(&e.name().as_ref());
                if !saw_root {
                    if name != "BesAdminCmd" {
                        return Err(BesError::SyntaxUser {
                            message: format!("expected root element BesAdminCmd, got {name}"),
                        });
                    }
                    saw_root = true;
                    continue;
                }

                let attrs = collect_attrs(&e);
                commands.push(build_command(&name, &attrs, String::new()));
            }
            Ok(Event::Start(e)) => {
                let name = local_name(&e.name().as_ref());
                if !saw_root {
                    if name != "BesAdminCmd" {
                        return Err(BesError::SyntaxUser {
                            message: format!("expected root element BesAdminCmd, got {name}"),
                        });
                    }
                    saw_root = true;
                    continue;
                }

                let attrs = collect_attrs(&e);
                let contents = read_text_until_end(&mut reader, &e.name().into_inner().to_vec())?;
                commands.push(build_command(&name, &attrs, contents));
            }
            Ok(Event::End(_)) => {}
            Ok(_) => {}
            Err(e) => {
                return Err(BesError::SyntaxUser { message: format!("malformed admin XML: {e}") })
            }
        }
        buf.clear();
    }

    if !saw_root {
        return Err(BesError::SyntaxUser { message: "missing BesAdminCmd root element".into() });
    }

    Ok(commands)
}

fn collect_attrs(e: &quick_xml::events::BytesStart) -> std::collections::HashMap<String, String> {
    let mut attrs = std::collections::HashMap::new();
    for attr in e.attributes().flatten() {
        let key = local_name(&attr.key.as_ref());
        let value = String::from_utf8_lossy(&attr.value).to_string();
        attrs.insert(key, value);
    }
    attrs
}

fn build_command(
    name: &str,
    attrs: &std::collections::HashMap<String, String>,
    text: String,
) -> AdminCommand {
    match name {
        "StopNow" => AdminCommand::StopNow,
        "Start" => AdminCommand::Start,
        "Exit" => AdminCommand::Exit,
        "GetConfig" => AdminCommand::GetConfig,
        "SetConfig" => AdminCommand::SetConfig {
            module: attrs.get("module").cloned().unwrap_or_default(),
            contents: text,
        },
        "TailLog" => AdminCommand::TailLog {
            lines: attrs.get("lines").and_then(|s| s.parse::<i64>().ok()).unwrap_or(0),
        },
        "GetLogContexts" => AdminCommand::GetLogContexts,
        "SetLogContext" => AdminCommand::SetLogContext {
            name: attrs.get("name").cloned().unwrap_or_default(),
            state: attrs.get("state").cloned().unwrap_or_default(),
        },
        other => AdminCommand::Unknown { name: other.to_string() },
    }
}

fn local_name(qualified: &[u8]) -> String {
    let s = String::from_utf8_lossy(qualified);
    match s.rfind(':') {
        Some(idx) => s[idx + 1..].to_string(),
        None => s.to_string(),
    }
}

fn read_text_until_end(reader: &mut Reader<&[u8]>, start_name: &[u8]) -> Result<String, BesError> {
    let mut text = String::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Text(t)) => {
                text.push_str(
                    &t.unescape()
                        .map_err(|e| BesError::SyntaxUser { message: format!("bad text node: {e}") })?,
                );
            }
            Ok(Event::CData(t)) => {
                text.push_str(&String::from_utf8_lossy(&t.into_inner()));
            }
            Ok(Event::End(e)) if e.name().into_inner() == start_name => break,
            Ok(Event::Eof) => {
                return Err(BesError::SyntaxUser { message: "unexpected EOF inside element".into() })
            }
            Ok(_) => {}
            Err(e) => {
                return Err(BesError::SyntaxUser { message: format!("malformed admin XML: {e}") })
            }
        }
        buf.clear();
    }
    Ok(text)
}

/// Processes one `BesAdminCmd` document and returns the full `hai:`
/// response XML, whether the admin connection/session should close after
/// this document, and the wire-level status the caller should frame the
/// response with. Signals are expected to be blocked by the caller for the
/// duration of this call, per spec §4.7.
pub fn process_document(
    xml: &str,
    supervisor: &mut dyn SupervisorControl,
    registry: &mut ConfigRegistry,
    contexts: &mut DebugContexts,
    log_file: Option<&str>,
) -> (String, bool, ResponseStatus) {
    let commands = match parse_commands(xml) {
        Ok(c) => {
            c
        }
        Err(e) => {
            return (
                xml::wrap_response(&xml::error_response("SyntaxUser", &e.to_string())),
                false,
                ResponseStatus::Error,
            )
        }
    };

    let mut out = String::new();
    let mut should_exit = false;
    let mut status = ResponseStatus::Ok;

    for command in commands {
        let (fragment, exit_after, command_status) = execute(command, supervisor, registry, contexts, log_file);
        out.push_str(&fragment);
        status = status.escalate(command_status);
        if exit_after {
            should_exit = true;
            break;
        }
    }

    (xml::wrap_response(&out), should_exit, status)
}

fn execute(
    command: AdminCommand,
    supervisor: &mut dyn SupervisorControl,
    registry: &mut ConfigRegistry,
    contexts: &mut DebugContexts,
    log_file: Option<&str>,
) -> (String, bool, ResponseStatus) {
    match command {
        AdminCommand::StopNow => {
            if !supervisor.is_master_running() {
                let msg = "master worker is already stopped";
                return (xml::error_response("InternalFatal", msg), false, status_for_error_kind("InternalFatal"));
            }
            match supervisor.stop_master() {
                Ok(()) => (xml::ok_response(), false, ResponseStatus::Ok),
                Err(e) => (
                    xml::error_response("InternalFatal", &e.to_string()),
                    false,
                    status_for_error_kind("InternalFatal"),
                ),
            }
        }
        AdminCommand::Start => {
            if supervisor.is_master_running() {
                let msg = "master worker is already running";
                return (xml::error_response("InternalFatal", msg), false, status_for_error_kind("InternalFatal"));
            }
            match supervisor.start_master() {
                Ok(()) => (xml::ok_response(), false, ResponseStatus::Ok),
                Err(e) => (
                    xml::error_response("InternalFatal", &e.to_string()),
                    false,
                    status_for_error_kind("InternalFatal"),
                ),
            }
        }
        AdminCommand::Exit => {
            let _ = supervisor.stop_master();
            (xml::ok_response(), true, ResponseStatus::Ok)
        }
        AdminCommand::GetConfig => (xml::get_config_response(registry), false, ResponseStatus::Ok),
        AdminCommand::SetConfig { module, contents } => match registry.set(&module, &contents) {
            Ok(()) => (xml::ok_with_restart_advisory(), false, ResponseStatus::Ok),
            Err(e) => (
                xml::error_response("InternalFatal", &e.to_string()),
                false,
                status_for_error_kind("InternalFatal"),
            ),
        },
        AdminCommand::TailLog { lines } => match log_file {
            Some(path) => match tail_lines(path, lines) {
                Ok(text) => (xml::bes_log_response(&text), false, ResponseStatus::Ok),
                Err(e) => (
                    xml::error_response("InternalFatal", &e.to_string()),
                    false,
                    status_for_error_kind("InternalFatal"),
                ),
            },
            None => (
                xml::error_response("InternalFatal", "no log file is configured"),
                false,
                status_for_error_kind("InternalFatal"),
            ),
        },
        AdminCommand::GetLogContexts => (xml::log_contexts_response(contexts), false, ResponseStatus::Ok),
        AdminCommand::SetLogContext { name, state } => {
            contexts.set(&name, state == "on");
            (xml::ok_response(), false, ResponseStatus::Ok)
        }
        AdminCommand::Unknown { name } => (
            xml::error_response("SyntaxUser", &format!("Command {name} unknown")),
            false,
            status_for_error_kind("SyntaxUser"),
        ),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FakeSupervisor {
        running: bool,
    }

    impl SupervisorControl for FakeSupervisor {
        fn is_master_running(&self) -> bool {
            self.running
        }
        fn stop_master(&mut self) -> anyhow::Result<()> {
            self.running = false;
            Ok(())
        }
        fn start_master(&mut self) -> anyhow::Result<()> {
            self.running = true;
            Ok(())
        }
    }

    #[test]
    fn rejects_wrong_root_element() {
        let err = parse_commands("<NotBesAdminCmd/>").unwrap_err();
        assert!(matches!(err, BesError::SyntaxUser { .. }));
    }

    #[test]
    fn parses_stop_now() {
        let commands = parse_commands("<BesAdminCmd><StopNow/></BesAdminCmd>").unwrap();
        assert_eq!(commands, vec![AdminCommand::StopNow]);
    }

    #[test]
    fn parses_set_config_with_module_and_body() {
        let commands = parse_commands(
            "<BesAdminCmd><SetConfig module=\"bes.conf\">hello=world</SetConfig></BesAdminCmd>",
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![AdminCommand::SetConfig { module: "bes.conf".into(), contents: "hello=world".into() }]
        );
    }

    #[test]
    fn unknown_element_maps_to_syntax_error_response() {
        let mut supervisor = FakeSupervisor { running: true };
        let mut registry = ConfigRegistry::new();
        let mut contexts = DebugContexts::new();
        let (response, exit, status) =
            process_document("<BesAdminCmd><Bogus/></BesAdminCmd>", &mut supervisor, &mut registry, &mut contexts, None);
        assert!(!exit);
        assert!(response.contains("BESError"));
        assert!(response.contains("SyntaxUser"));
        assert_eq!(status, ResponseStatus::Error);
    }

    #[test]
    fn stop_now_on_already_stopped_master_is_an_error() {
        let mut supervisor = FakeSupervisor { running: false };
        let mut registry = ConfigRegistry::new();
        let mut contexts = DebugContexts::new();
        let (response, exit, status) =
            process_document("<BesAdminCmd><StopNow/></BesAdminCmd>", &mut supervisor, &mut registry, &mut contexts, None);
        assert!(!exit);
        assert!(response.contains("BESError"));
        assert_eq!(status, ResponseStatus::Fatal);
    }

    #[test]
    fn exit_command_closes_after_ok() {
        let mut supervisor = FakeSupervisor { running: true };
        let mut registry = ConfigRegistry::new();
        let mut contexts = DebugContexts::new();
        let (response, exit, status) =
            process_document("<BesAdminCmd><Exit/></BesAdminCmd>", &mut supervisor, &mut registry, &mut contexts, None);
        assert!(exit);
        assert!(response.contains("OK"));
        assert!(!supervisor.is_master_running());
        assert_eq!(status, ResponseStatus::Ok);
    }

    #[test]
    fn commands_process_in_document_order() {
        let mut supervisor = FakeSupervisor { running: true };
        let mut registry = ConfigRegistry::new();
        let mut contexts = DebugContexts::new();
        let (response, exit, status) = process_document(
            "<BesAdminCmd><SetLogContext name=\"ppt\" state=\"on\"/><GetLogContexts/></BesAdminCmd>",
            &mut supervisor,
            &mut registry,
            &mut contexts,
            None,
        );
        assert!(!exit);
        assert!(response.contains("ppt"));
        assert!(contexts.iter().any(|(n, on)| n == "ppt" && on));
        assert_eq!(status, ResponseStatus::Ok);
    }

    #[test]
    fn malformed_xml_escalates_to_error_status() {
        let mut supervisor = FakeSupervisor { running: true };
        let mut registry = ConfigRegistry::new();
        let mut contexts = DebugContexts::new();
        let (response, exit, status) =
            process_document("<NotBesAdminCmd/>", &mut supervisor, &mut registry, &mut contexts, None);
        assert!(!exit);
        assert!(response.contains("BESError"));
        assert_eq!(status, ResponseStatus::Error);
    }
}
