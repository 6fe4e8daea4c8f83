// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The `liteCNS` device: name resolution served over litebus itself.
//!
//! - `devices` (R): the registered logical names
//! - `query` (W): write a name, read back `"host;port[;device]"` or an
//!   `ERROR:` line
//! - `time` (R): current time, refreshed on every get

use litebus::util::now_ts;
use litebus::{CnsFile, Device, Ldo, LdoValue};
use std::sync::Arc;

/// Build the `liteCNS` device from a loaded name map.
pub fn build(file: CnsFile) -> Arc<Device> {
    let mut names: Vec<String> = file.hosts.keys().cloned().collect();
    names.sort();
    let lookup = file.hosts;
    let site_cns = file.site_cns;
    if let Some(site) = &site_cns {
        log::info!("name resolution will be re-directed to {site}");
    }

    Device::builder("liteCNS")
        .param(
            "devices",
            Ldo::new("R", "Registered devices", LdoValue::strs(names)),
        )
        .param(
            "query",
            Ldo::new("W", "Provides reply on written query", LdoValue::text("")),
        )
        .set_hook(
            "query",
            move |dev: &Device, name: &str, _old: &LdoValue, new: &LdoValue| {
                let asked = new.first_str().unwrap_or("").to_string();
                let reply = match &site_cns {
                    Some(site) => {
                        format!("ERROR: Name service re-direction to SiteCNSHost {site}")
                    }
                    None => match lookup.get(&asked) {
                        Some(resolution) => resolution.clone(),
                        None => {
                            let msg = format!("ERROR: Device {asked} is not registered");
                            let _ =
                                dev.set_value_ts("status", LdoValue::text(msg.clone()), now_ts());
                            msg
                        }
                    },
                };
                log::info!("query {asked} -> {reply}");
                // The answer rides back in the query parameter itself.
                dev.set_value_ts(name, LdoValue::text(reply), now_ts())
            },
        )
        .param(
            "time",
            Ldo::new("R", "Current time", LdoValue::floats([now_ts()])).with_units("s"),
        )
        .read_hook("time", |dev: &Device, name: &str| {
            let t = now_ts();
            dev.set_value_ts(name, LdoValue::floats([t]), t)
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_file() -> CnsFile {
        let mut hosts = HashMap::new();
        hosts.insert("peakSim".to_string(), "simhost;9701".to_string());
        CnsFile {
            hosts,
            site_cns: None,
        }
    }

    #[test]
    fn test_query_answers_registered_name() {
        let dev = build(sample_file());
        let answer = dev
            .set_param("query", LdoValue::text("peakSim"))
            .expect("query set");
        assert_eq!(answer, LdoValue::text("simhost;9701"));
        // The stored parameter carries the answer as well.
        assert_eq!(dev.value("query"), Some(LdoValue::text("simhost;9701")));
    }

    #[test]
    fn test_query_unknown_name_reports_error() {
        let dev = build(sample_file());
        let answer = dev
            .set_param("query", LdoValue::text("noSuchDevice"))
            .expect("query set");
        match answer.first_str() {
            Some(s) => assert!(s.starts_with("ERROR")),
            None => panic!("expected a string answer"),
        }
    }

    #[test]
    fn test_site_redirect_answers_error_text() {
        let file = CnsFile {
            hosts: HashMap::new(),
            site_cns: Some("central;9700".to_string()),
        };
        let dev = build(file);
        let answer = dev
            .set_param("query", LdoValue::text("anything"))
            .expect("query set");
        let text = answer.first_str().expect("string answer");
        assert!(text.contains("re-direction"));
        assert!(text.contains("central;9700"));
    }

    #[test]
    fn test_devices_parameter_lists_names() {
        let dev = build(sample_file());
        assert_eq!(
            dev.value("devices"),
            Some(LdoValue::strs(vec!["peakSim".to_string()]))
        );
    }

    #[test]
    fn test_time_refreshes_on_read_hook() {
        let dev = build(sample_file());
        dev.refresh_param("time").expect("refresh");
        let t1 = dev.timestamp("time").expect("timestamp");
        std::thread::sleep(std::time::Duration::from_millis(2));
        dev.refresh_param("time").expect("refresh");
        let t2 = dev.timestamp("time").expect("timestamp");
        assert!(t2 > t1);
    }
}
