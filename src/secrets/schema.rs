//! The fixed set of secret groups the lab needs

/// A group of related fields stored together at one path
#[derive(Debug, Clone, Copy)]
pub struct GroupSpec {
    /// Store path relative to the KV mount, e.g. "netbox/admin"
    pub path: &'static str,
    pub fields: &'static [FieldSpec],
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub source: FieldSource,
}

/// Where a field's value comes from
#[derive(Debug, Clone, Copy)]
pub enum FieldSource {
    /// Ask the operator
    Prompt {
        label: &'static str,
        /// Hidden input, never echoed
        confidential: bool,
        default: Option<&'static str>,
        /// When set, the collected answer is also published as a plan
        /// variable under this key (non-confidential fields only)
        var_key: Option<&'static str>,
    },
    /// Generated 40-hex-char token
    ApiToken,
    /// Read from an existing key file, or generated with ssh-keygen
    SshPrivateKey,
}

/// Everything the seeder writes, in write order
pub const SECRET_GROUPS: &[GroupSpec] = &[
    GroupSpec {
        path: "netbox/admin",
        fields: &[
            FieldSpec {
                name: "username",
                source: FieldSource::Prompt {
                    label: "NetBox admin username",
                    confidential: false,
                    default: Some("admin"),
                    var_key: None,
                },
            },
            FieldSpec {
                name: "password",
                source: FieldSource::Prompt {
                    label: "NetBox admin password",
                    confidential: true,
                    default: None,
                    var_key: None,
                },
            },
            FieldSpec {
                name: "email",
                source: FieldSource::Prompt {
                    label: "NetBox admin email",
                    confidential: false,
                    default: Some("admin@lab.local"),
                    var_key: None,
                },
            },
            FieldSpec {
                name: "api_token",
                source: FieldSource::ApiToken,
            },
            FieldSpec {
                name: "host",
                source: FieldSource::Prompt {
                    label: "NetBox hostname",
                    confidential: false,
                    default: Some("netbox.lab.local"),
                    var_key: Some("netbox_host"),
                },
            },
        ],
    },
    GroupSpec {
        path: "awx/admin",
        fields: &[
            FieldSpec {
                name: "username",
                source: FieldSource::Prompt {
                    label: "AWX admin username",
                    confidential: false,
                    default: Some("admin"),
                    var_key: None,
                },
            },
            FieldSpec {
                name: "password",
                source: FieldSource::Prompt {
                    label: "AWX admin password",
                    confidential: true,
                    default: None,
                    var_key: None,
                },
            },
            FieldSpec {
                name: "host",
                source: FieldSource::Prompt {
                    label: "AWX hostname",
                    confidential: false,
                    default: Some("awx.lab.local"),
                    var_key: Some("awx_host"),
                },
            },
        ],
    },
    GroupSpec {
        path: "awx/ssh",
        fields: &[
            FieldSpec {
                name: "username",
                source: FieldSource::Prompt {
                    label: "SSH username for managed hosts",
                    confidential: false,
                    default: Some("admin"),
                    var_key: None,
                },
            },
            FieldSpec {
                name: "private_key",
                source: FieldSource::SshPrivateKey,
            },
            FieldSpec {
                name: "password",
                source: FieldSource::Prompt {
                    label: "SSH key passphrase (empty for none)",
                    confidential: true,
                    default: Some(""),
                    var_key: None,
                },
            },
        ],
    },
    GroupSpec {
        path: "awx/config",
        fields: &[
            FieldSpec {
                name: "git_repo_url",
                source: FieldSource::Prompt {
                    label: "Automation project git URL",
                    confidential: false,
                    default: Some("https://github.com/example/lab-playbooks.git"),
                    var_key: Some("git_repo_url"),
                },
            },
            FieldSpec {
                name: "git_branch",
                source: FieldSource::Prompt {
                    label: "Automation project git branch",
                    confidential: false,
                    default: Some("main"),
                    var_key: Some("git_branch"),
                },
            },
        ],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_paths_are_unique() {
        let mut paths: Vec<_> = SECRET_GROUPS.iter().map(|g| g.path).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), SECRET_GROUPS.len());
    }

    #[test]
    fn test_confidential_fields_never_publish_variables() {
        for group in SECRET_GROUPS {
            for field in group.fields {
                if let FieldSource::Prompt {
                    confidential: true,
                    var_key,
                    ..
                } = field.source
                {
                    assert!(
                        var_key.is_none(),
                        "{}/{} is confidential but publishes a variable",
                        group.path,
                        field.name
                    );
                }
            }
        }
    }
}
