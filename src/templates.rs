//! Built-in samples for the `provisioner template` subcommand.

/// Metadata for a template type.
#[derive(Debug, Clone)]
pub struct TemplateInfo {
    /// Template name (matches the CLI `--type` value).
    pub name: &'static str,
    /// Short description shown in the listing table.
    pub description: &'static str,
}

/// Returns metadata for every available template.
pub fn list_templates() -> Vec<TemplateInfo> {
    vec![
        TemplateInfo {
            name: "worker",
            description: "Worker configuration file (YAML) with every setting",
        },
        TemplateInfo {
            name: "create",
            description: "Task envelope: create a node on OpenStack",
        },
        TemplateInfo {
            name: "confirm",
            description: "Task envelope: wait for a node and verify SSH access",
        },
        TemplateInfo {
            name: "delete",
            description: "Task envelope: destroy a node",
        },
        TemplateInfo {
            name: "install",
            description: "Task envelope: run a service install script over SSH",
        },
    ]
}

/// Returns the content for a given template type.
///
/// The `template_type` must be one of: `worker`, `create`, `confirm`, `delete`, `install`.
pub fn get_template(template_type: &str) -> Option<&'static str> {
    match template_type {
        "worker" => Some(TEMPLATE_WORKER),
        "create" => Some(TEMPLATE_CREATE),
        "confirm" => Some(TEMPLATE_CONFIRM),
        "delete" => Some(TEMPLATE_DELETE),
        "install" => Some(TEMPLATE_INSTALL),
        _ => None,
    }
}

const TEMPLATE_WORKER: &str = r#"# Provisioner worker configuration
# Every key can be overridden from the environment, e.g.
#   PROVISIONER__WORKER__CONCURRENCY=8
#   PROVISIONER__LOGGING__LEVEL=debug

logging:
  level: info            # debug | info | warn | error | fatal
  format: pretty         # pretty | json
  destination: stderr    # stdout | stderr | /path/to/file.log
  process_name: worker-01

provider:
  kind: openstack
  ready_timeout_secs: 600
  poll_interval_secs: 5
  ssh_port: 22
  verify_command: "uname -a"
  # Uncomment to ping a host from each node during confirm
  # connectivity_check_host: www.example.com
  api_timeout_secs: 60

automator:
  kind: shell
  remote_cache_dir: /var/cache/provisioner

ssh:
  connect_timeout_secs: 10
  session_timeout_secs: 300
  sshd_retries: 8
  sshd_base_delay_ms: 1000
  sshd_max_delay_ms: 30000

worker:
  concurrency: 4
  shutdown_signal: TERM
  # metrics_port: 9090
"#;

const TEMPLATE_CREATE: &str = r#"{
  "taskName": "create",
  "taskId": "cluster-00042-create-node1",
  "config": {
    "hostname": "node1.cluster.example.com",
    "flavor": "m1.small",
    "image": "centos-7-x86_64",
    "sshuser": "centos",
    "provider": {
      "name": "openstack",
      "provisioner": {
        "openstack_username": "admin",
        "openstack_password": "changeme",
        "openstack_tenant": "dev",
        "openstack_auth_url": "https://keystone.example.com:5000/v2.0",
        "openstack_keyname": "provisioner",
        "openstack_keyfile": "/etc/provisioner/keys/provisioner.pem",
        "security_groups": "default,ssh"
      }
    }
  }
}
"#;

const TEMPLATE_CONFIRM: &str = r#"{
  "taskName": "confirm",
  "taskId": "cluster-00042-confirm-node1",
  "config": {
    "hostname": "node1.cluster.example.com",
    "providerid": "5a1b0d3e-6f7c-4e2a-9b1d-0c8e7f6a5b4c",
    "ssh-auth": {
      "user": "centos",
      "identityfile": "/etc/provisioner/keys/provisioner.pem"
    },
    "provider": {
      "name": "openstack",
      "provisioner": {
        "openstack_username": "admin",
        "openstack_password": "changeme",
        "openstack_tenant": "dev",
        "openstack_auth_url": "https://keystone.example.com:5000/v2.0",
        "network": "public"
      }
    }
  }
}
"#;

const TEMPLATE_DELETE: &str = r#"{
  "taskName": "delete",
  "taskId": "cluster-00042-delete-node1",
  "config": {
    "providerid": "5a1b0d3e-6f7c-4e2a-9b1d-0c8e7f6a5b4c",
    "provider": {
      "name": "openstack",
      "provisioner": {
        "openstack_username": "admin",
        "openstack_password": "changeme",
        "openstack_tenant": "dev",
        "openstack_auth_url": "https://keystone.example.com:5000/v2.0"
      }
    }
  }
}
"#;

const TEMPLATE_INSTALL: &str = r#"{
  "taskName": "install",
  "taskId": "cluster-00042-install-hadoop-node1",
  "config": {
    "hostname": "node1.cluster.example.com",
    "ipaddresses": { "access_v4": "10.0.0.5", "bind_v4": "10.0.0.5" },
    "ssh-auth": {
      "user": "centos",
      "identityfile": "/etc/provisioner/keys/provisioner.pem"
    },
    "service": {
      "name": "hadoop-hdfs-namenode",
      "action": {
        "type": "install",
        "fields": {
          "script": "/opt/recipes/hadoop/install.sh",
          "args": ["--role", "namenode"]
        }
      }
    }
  }
}
"#;
