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

//! Builds the `hai:`-namespaced admin response XML fragments, grounded on
//! the vocabulary `DaemonCommandHandler.cc` writes back to the admin
//! client (`hai:OK`, `hai:BESError`, `hai:BesConfig`, `hai:BesLog`,
//! `hai:LogContext`).

use super::{ConfigRegistry, DebugContexts};

const NAMESPACE_DECL: &str = r#"xmlns:hai="http://xml.hdfgroup.org/hai""#;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn ok_response() -> String {
    "<hai:OK/>".to_string()
}

pub fn ok_with_restart_advisory() -> String {
    "<hai:OK><hai:Message>changes take effect on next restart</hai:Message></hai:OK>".to_string()
}

pub fn error_response(kind: &str, message: &str) -> String {
    format!(
        r#"<hai:BESError type="{}"><hai:Message>{}</hai:Message></hai:BESError>"#,
        escape(kind),
        escape(message)
    )
}

pub fn get_config_response(registry: &ConfigRegistry) -> String {
    let mut body = String::new();
    for module in registry.modules().map(str::to_string).collect::<Vec<_>>() {
        match registry.get(&module) {
            Ok(contents) => {
                body.push_str(&format!(
                    r#"<hai:BesConfig module="{}">{}</hai:BesConfig>"#,
                    escape(&module),
                    escape(&contents)
                ));
            }
            Err(e) => body.push_str(&error_response("InternalFatal", &e.to_string())),
        }
    }
    body
}

pub fn bes_log_response(text: &str) -> String {
    format!("<hai:BesLog>{}</hai:BesLog>", escape(text))
}

pub fn log_contexts_response(contexts: &DebugContexts) -> String {
    let mut body = String::new();
    for (name, on) in contexts.iter() {
        body.push_str(&format!(
            r#"<hai:LogContext name="{}" state="{}"/>"#,
            escape(name),
            if on { "on" } else { "off" }
        ));
    }
    body
}

/// Wraps already-built response fragments in the top-level `hai:response`
/// envelope and namespace declaration.
pub fn wrap_response(fragments: &str) -> String {
    format!(r#"<?xml version="1.0" encoding="UTF-8"?><hai:response {NAMESPACE_DECL}>{fragments}</hai:response>"#)
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn ok_response_has_no_message() {
        assert_eq!(ok_response(), "<hai:OK/>");
    }

    #[test]
    fn error_response_escapes_message_text() {
        let xml = error_response("SyntaxUser", "bad <tag> & stuff");
        assert!(xml.contains("bad &lt;tag&gt; &amp; stuff"));
        assert!(xml.contains(r#"type="SyntaxUser""#));
    }

    #[test]
    fn wrap_response_declares_the_hai_namespace() {
        let xml = wrap_response("<hai:OK/>");
        assert!(xml.contains("xmlns:hai="));
        assert!(xml.contains("<hai:OK/>"));
    }

    #[test]
    fn log_contexts_response_reflects_on_off_state() {
        let mut contexts = DebugContexts::new();
        contexts.set("ppt", true);
        contexts.set("besdaemon", false);
        let xml = log_contexts_response(&contexts);
        assert!(xml.contains(r#"name="ppt" state="on""#));
        assert!(xml.contains(r#"name="besdaemon" state="off""#));
    }

    #[test]
    fn get_config_response_includes_module_name_and_contents() {
        let mut paths = BTreeMap::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bes.conf");
        std::fs::write(&path, "Bes.Data=on").unwrap();
        paths.insert("bes.conf".to_string(), path.to_str().unwrap().to_string());
        let registry = ConfigRegistry::from_map(paths);

        let xml = get_config_response(&registry);
        assert!(xml.contains(r#"module="bes.conf""#));
        assert!(xml.contains("Bes.Data=on"));
    }
}
