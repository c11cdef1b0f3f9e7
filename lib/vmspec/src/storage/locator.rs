// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Classification of image locators into protocol nodes.

use thiserror::Error;
use vmspec_types::instance_spec::components::backends::{
    CurlProtocol, ProtocolNode, ServerAddress,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StorageClassificationError {
    #[error("image {image} has an empty locator")]
    Empty { image: String },

    #[error("image {image}: unrecognized locator {locator:?}")]
    UnknownScheme { image: String, locator: String },

    #[error("image {image}: malformed {scheme} locator {locator:?}: {reason}")]
    Malformed {
        image: String,
        scheme: &'static str,
        locator: String,
        reason: &'static str,
    },
}

/// A classified locator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Locator {
    Plain(ProtocolNode),
    /// A `blkdebug:<config>:<inner>` wrapper around another protocol.
    Blkdebug { config: String, inner: ProtocolNode },
}

impl Locator {
    /// The protocol that reads the actual image data.
    pub fn data_protocol(&self) -> &ProtocolNode {
        match self {
            Locator::Plain(protocol) => protocol,
            Locator::Blkdebug { inner, .. } => inner,
        }
    }
}

struct Classifier<'a> {
    image: &'a str,
    locator: &'a str,
}

impl Classifier<'_> {
    fn malformed(
        &self,
        scheme: &'static str,
        reason: &'static str,
    ) -> StorageClassificationError {
        StorageClassificationError::Malformed {
            image: self.image.to_owned(),
            scheme,
            locator: self.locator.to_owned(),
            reason,
        }
    }

    fn unknown(&self) -> StorageClassificationError {
        StorageClassificationError::UnknownScheme {
            image: self.image.to_owned(),
            locator: self.locator.to_owned(),
        }
    }

    /// Splits `host[:port]` or `[v6addr][:port]`.
    fn host_port(
        &self,
        scheme: &'static str,
        authority: &str,
    ) -> Result<ServerAddress, StorageClassificationError> {
        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| {
                self.malformed(scheme, "unterminated IPv6 address")
            })?;
            match tail {
                "" => (host, None),
                t => (host, Some(t.strip_prefix(':').unwrap_or(t))),
            }
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(self.malformed(scheme, "missing host"));
        }
        let port = port
            .map(|p| p.parse::<u16>())
            .transpose()
            .map_err(|_| self.malformed(scheme, "invalid port"))?;
        Ok(ServerAddress::Inet { host: host.to_owned(), port })
    }

    fn classify(
        &self,
        locator: &str,
    ) -> Result<ProtocolNode, StorageClassificationError> {
        if let Some(rest) = locator.strip_prefix("rbd:") {
            return match rest.split_once('/') {
                Some((pool, image))
                    if !pool.is_empty() && !image.is_empty() =>
                {
                    Ok(ProtocolNode::Rbd {
                        pool: pool.to_owned(),
                        image: image.to_owned(),
                    })
                }
                _ => Err(self.malformed("rbd", "expected rbd:<pool>/<image>")),
            };
        }

        let Some((scheme, rest)) = locator.split_once("://") else {
            return self.classify_path(locator);
        };
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));

        match scheme {
            "nbd" => Ok(ProtocolNode::Nbd {
                server: self.host_port("nbd", authority)?,
                export: (!path.is_empty()).then(|| path.to_owned()),
            }),
            "nbd+unix" => {
                let (export, query) =
                    path.split_once('?').unwrap_or((path, ""));
                let socket = query
                    .split('&')
                    .find_map(|kv| kv.strip_prefix("socket="))
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        self.malformed("nbd+unix", "missing socket= parameter")
                    })?;
                Ok(ProtocolNode::Nbd {
                    server: ServerAddress::Unix { path: socket.to_owned() },
                    export: (!export.is_empty()).then(|| export.to_owned()),
                })
            }
            "iscsi" => {
                self.host_port("iscsi", authority)?;
                let (target, lun) = path
                    .split_once('/')
                    .filter(|(t, _)| !t.is_empty())
                    .ok_or_else(|| {
                        self.malformed("iscsi", "expected /<target>/<lun>")
                    })?;
                let lun = lun
                    .parse()
                    .map_err(|_| self.malformed("iscsi", "invalid LUN"))?;
                Ok(ProtocolNode::Iscsi {
                    portal: authority.to_owned(),
                    target: target.to_owned(),
                    lun,
                })
            }
            "gluster" => {
                let server = self.host_port("gluster", authority)?;
                let (volume, image) = path
                    .split_once('/')
                    .filter(|(v, p)| !v.is_empty() && !p.is_empty())
                    .ok_or_else(|| {
                        self.malformed("gluster", "expected /<volume>/<path>")
                    })?;
                Ok(ProtocolNode::Gluster {
                    server,
                    volume: volume.to_owned(),
                    path: image.to_owned(),
                })
            }
            "ssh" => {
                let (user, host) = match authority.split_once('@') {
                    Some((user, host)) => (Some(user.to_owned()), host),
                    None => (None, authority),
                };
                if path.is_empty() {
                    return Err(self.malformed("ssh", "missing path"));
                }
                Ok(ProtocolNode::Ssh {
                    server: self.host_port("ssh", host)?,
                    path: format!("/{path}"),
                    user,
                })
            }
            s => match CurlProtocol::from_scheme(s) {
                Some(protocol) if !authority.is_empty() => {
                    Ok(ProtocolNode::Curl { protocol, url: locator.to_owned() })
                }
                Some(_) => Err(self.malformed("curl", "missing host")),
                None => Err(self.unknown()),
            },
        }
    }

    fn classify_path(
        &self,
        path: &str,
    ) -> Result<ProtocolNode, StorageClassificationError> {
        // `scheme:rest` forms other than the ones handled above.
        if let Some((prefix, _)) = path.split_once(':') {
            if !prefix.contains('/') {
                return Err(self.unknown());
            }
        }

        let filename = path.to_owned();
        if path.starts_with("/dev/") {
            Ok(ProtocolNode::HostDevice { filename, aio: None })
        } else {
            Ok(ProtocolNode::File { filename, aio: None })
        }
    }
}

/// Classifies the locator of image `image`.
pub fn classify(
    image: &str,
    locator: &str,
) -> Result<Locator, StorageClassificationError> {
    let locator = locator.trim();
    if locator.is_empty() {
        return Err(StorageClassificationError::Empty {
            image: image.to_owned(),
        });
    }

    let classifier = Classifier { image, locator };
    match locator.strip_prefix("blkdebug:") {
        Some(rest) => {
            let (config, inner) = rest
                .split_once(':')
                .filter(|(_, inner)| !inner.is_empty())
                .ok_or_else(|| {
                    classifier.malformed(
                        "blkdebug",
                        "expected blkdebug:<config>:<image>",
                    )
                })?;
            Ok(Locator::Blkdebug {
                config: config.to_owned(),
                inner: classifier.classify(inner)?,
            })
        }
        None => classifier.classify(locator).map(Locator::Plain),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn plain(locator: &str) -> ProtocolNode {
        match classify("image1", locator).unwrap() {
            Locator::Plain(p) => p,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn inet(host: &str, port: Option<u16>) -> ServerAddress {
        ServerAddress::Inet { host: host.to_owned(), port }
    }

    #[test]
    fn files_and_devices() {
        assert_eq!(
            plain("/var/lib/images/rhel.qcow2"),
            ProtocolNode::File {
                filename: "/var/lib/images/rhel.qcow2".to_owned(),
                aio: None
            }
        );
        assert_eq!(plain("images/rhel.qcow2").driver(), "file");
        assert_eq!(plain("/dev/sdb").driver(), "host_device");
    }

    #[test]
    fn network_protocols() {
        assert_eq!(
            plain("nbd://storage.example.com/export1"),
            ProtocolNode::Nbd {
                server: inet("storage.example.com", None),
                export: Some("export1".to_owned()),
            }
        );
        assert_eq!(
            plain("nbd+unix:///disk?socket=/run/nbd.sock"),
            ProtocolNode::Nbd {
                server: ServerAddress::Unix {
                    path: "/run/nbd.sock".to_owned(),
                },
                export: Some("disk".to_owned()),
            }
        );
        assert_eq!(
            plain("iscsi://10.0.0.5:3260/iqn.2024-01.com.example:t1/2"),
            ProtocolNode::Iscsi {
                portal: "10.0.0.5:3260".to_owned(),
                target: "iqn.2024-01.com.example:t1".to_owned(),
                lun: 2,
            }
        );
        assert_eq!(
            plain("gluster://[fd00::1]:24007/vol0/dir/img.raw"),
            ProtocolNode::Gluster {
                server: inet("fd00::1", Some(24007)),
                volume: "vol0".to_owned(),
                path: "dir/img.raw".to_owned(),
            }
        );
        assert_eq!(
            plain("ssh://root@host1:2222/images/a.qcow2"),
            ProtocolNode::Ssh {
                server: inet("host1", Some(2222)),
                path: "/images/a.qcow2".to_owned(),
                user: Some("root".to_owned()),
            }
        );
        assert_eq!(
            plain("rbd:pool0/img0"),
            ProtocolNode::Rbd {
                pool: "pool0".to_owned(),
                image: "img0".to_owned(),
            }
        );
        assert_eq!(plain("https://mirror.example.com/a.iso").driver(), "https");
    }

    #[test]
    fn blkdebug_wraps_inner_protocol() {
        let locator =
            classify("image1", "blkdebug:/tmp/rules.cfg:/images/a.qcow2")
                .unwrap();
        let Locator::Blkdebug { config, inner } = &locator else {
            panic!("unexpected {locator:?}");
        };
        assert_eq!(config, "/tmp/rules.cfg");
        assert_eq!(inner.driver(), "file");
        assert_eq!(locator.data_protocol().driver(), "file");
    }

    #[test]
    fn rejected_locators() {
        assert!(matches!(
            classify("image1", "  "),
            Err(StorageClassificationError::Empty { .. })
        ));
        for locator in ["sheepdog:vdi1", "vxhs://host/vdisk", "fat:rw:/tmp"] {
            assert!(
                matches!(
                    classify("image1", locator),
                    Err(StorageClassificationError::UnknownScheme { .. })
                ),
                "{locator}"
            );
        }
        for locator in [
            "nbd://:10809/export",
            "nbd://host:port/export",
            "nbd+unix:///export",
            "iscsi://host/target",
            "gluster://host/vol",
            "rbd:pool",
            "blkdebug:/tmp/rules.cfg",
        ] {
            assert!(
                matches!(
                    classify("image1", locator),
                    Err(StorageClassificationError::Malformed { .. })
                ),
                "{locator}"
            );
        }
    }
}
