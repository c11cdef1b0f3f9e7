// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Character device backends and monitors.

use slog::{debug, Logger};
use vmspec_params::{ParamError, ParameterSet};
use vmspec_types::instance_spec::components::backends::{
    Chardev, ChardevBackend, Monitor, MonitorProtocol,
};

use crate::error::CompileError;
use crate::host::HostLeases;

/// Builds the chardev `id` for `owner` from `params`, which are already
/// scoped to the owner.
pub fn build_chardev(
    log: &Logger,
    id: String,
    owner: &str,
    vm_name: &str,
    params: &ParameterSet,
    leases: &mut HostLeases<'_>,
) -> Result<Chardev, CompileError> {
    let tmp_dir = params.get_or("vm_tmp_dir", "/var/tmp");
    let tmp_dir = tmp_dir.trim_end_matches('/');
    let server = params.get_bool_or("chardev_server", true)?;
    let wait = params.get_bool_or("chardev_wait", false)?;

    let raw = params.get_or("chardev_backend", "unix_socket");
    let backend = match raw {
        "unix_socket" => ChardevBackend::UnixSocket {
            path: params
                .get("chardev_path")
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{tmp_dir}/{vm_name}-{owner}.sock")),
            server,
            wait,
        },
        "tcp_socket" => ChardevBackend::TcpSocket {
            host: params.get_or("chardev_host", "127.0.0.1").to_owned(),
            port: leases.tcp_port(
                log,
                owner,
                params.get_numeric("chardev_port")?,
            )?,
            server,
            wait,
        },
        "file" => ChardevBackend::File {
            path: params
                .get("chardev_path")
                .map(str::to_owned)
                .unwrap_or_else(|| format!("{tmp_dir}/{vm_name}-{owner}.log")),
        },
        "pty" => ChardevBackend::Pty,
        "null" => ChardevBackend::Null,
        other => {
            return Err(ParamError::invalid(
                &format!("chardev_backend_{owner}"),
                other,
                "unix_socket, tcp_socket, file, pty or null",
            )
            .into())
        }
    };

    debug!(log, "built chardev"; "id" => &id, "backend" => raw);
    Ok(Chardev { id, backend })
}

/// Builds every monitor in `monitors` along with its chardev.
pub fn build_monitors(
    log: &Logger,
    vm_name: &str,
    params: &ParameterSet,
    leases: &mut HostLeases<'_>,
) -> Result<Vec<(Monitor, Chardev)>, CompileError> {
    let mut monitors = Vec::new();
    for name in params.objects("monitors") {
        let monitor_params = params.object_params(name);
        let protocol = match monitor_params.get_or("monitor_type", "qmp") {
            "qmp" => MonitorProtocol::Qmp,
            "hmp" => MonitorProtocol::Hmp,
            other => {
                return Err(ParamError::invalid(
                    &format!("monitor_type_{name}"),
                    other,
                    "qmp or hmp",
                )
                .into())
            }
        };

        let chardev = build_chardev(
            log,
            format!("qmp_id_{name}"),
            name,
            vm_name,
            &monitor_params,
            leases,
        )?;
        monitors.push((
            Monitor {
                name: name.to_owned(),
                protocol,
                chardev: chardev.id.clone(),
            },
            chardev,
        ));
    }
    Ok(monitors)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::StaticHost;
    use crate::test_logger;

    #[test]
    fn default_unix_socket_path() {
        let host = StaticHost::default();
        let mut leases = HostLeases::new(&host);
        let params: ParameterSet =
            [("vm_tmp_dir", "/tmp/avocado/")].into_iter().collect();
        let chardev = build_chardev(
            &test_logger(),
            "chardev_serial0".to_owned(),
            "serial0",
            "vm1",
            &params,
            &mut leases,
        )
        .unwrap();
        assert_eq!(
            chardev.backend,
            ChardevBackend::UnixSocket {
                path: "/tmp/avocado/vm1-serial0.sock".to_owned(),
                server: true,
                wait: false,
            }
        );
    }

    #[test]
    fn monitors_get_distinct_tcp_ports() {
        let host = StaticHost::default();
        let mut leases = HostLeases::new(&host);
        let params: ParameterSet = [
            ("monitors", "qmpmonitor1 hmp1"),
            ("monitor_type_hmp1", "hmp"),
            ("chardev_backend", "tcp_socket"),
        ]
        .into_iter()
        .collect();
        let monitors =
            build_monitors(&test_logger(), "vm1", &params, &mut leases)
                .unwrap();

        let ports: Vec<u16> = monitors
            .iter()
            .map(|(_, c)| match c.backend {
                ChardevBackend::TcpSocket { port, .. } => port,
                _ => panic!("expected a TCP chardev"),
            })
            .collect();
        assert_eq!(ports, vec![5000, 5001]);
        assert_eq!(monitors[0].0.chardev, "qmp_id_qmpmonitor1");
        assert_eq!(monitors[1].0.protocol, MonitorProtocol::Hmp);
    }

    #[test]
    fn unknown_backend() {
        let host = StaticHost::default();
        let mut leases = HostLeases::new(&host);
        let params: ParameterSet =
            [("chardev_backend", "spice")].into_iter().collect();
        assert!(matches!(
            build_chardev(
                &test_logger(),
                "c".to_owned(),
                "serial0",
                "vm1",
                &params,
                &mut leases
            ),
            Err(CompileError::Param(ParamError::Invalid { .. }))
        ));
    }
}
