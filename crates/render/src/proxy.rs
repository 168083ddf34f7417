//! Reverse-proxy (nginx) configuration text for the coordinator's gateway.

use std::fmt::Write as _;

use mimir_core::{Assignment, WorkerRole};

pub const PROXY_CERT_PATH: &str = "/etc/nginx/certs/server.cert";
pub const PROXY_KEY_PATH: &str = "/etc/nginx/certs/server.key";
pub const PROXY_PORT: u16 = 8080;

/// One nginx directive; `block` is `Some` for `name args { ... }` forms.
#[derive(Debug, Clone)]
struct Directive {
    name: String,
    args: Vec<String>,
    block: Option<Vec<Directive>>,
}

fn d(name: &str, args: &[&str]) -> Directive {
    Directive { name: name.into(), args: args.iter().map(|a| a.to_string()).collect(), block: None }
}

fn b(name: &str, args: &[&str], block: Vec<Directive>) -> Directive {
    Directive { block: Some(block), ..d(name, args) }
}

fn quote(arg: &str) -> String {
    if arg.is_empty() {
        "''".into()
    } else if arg.contains(char::is_whitespace) && !arg.starts_with('\'') {
        format!("'{}'", arg)
    } else {
        arg.to_string()
    }
}

fn write_block(out: &mut String, items: &[Directive], depth: usize) {
    let pad = "    ".repeat(depth);
    for item in items {
        let _ = write!(out, "{}{}", pad, quote(&item.name));
        for a in &item.args {
            let _ = write!(out, " {}", quote(a));
        }
        match &item.block {
            None => out.push_str(";\n"),
            Some(inner) => {
                out.push_str(" {\n");
                write_block(out, inner, depth + 1);
                let _ = writeln!(out, "{}}}", pad);
            }
        }
    }
}

fn proxy_pass(scheme: &str, upstream: &str) -> Directive { d("proxy_pass", &[format!("{}://{}", scheme, upstream).as_str()]) }

fn location(args: &[&str], scheme: &str, upstream: &str) -> Directive { b("location", args, vec![proxy_pass(scheme, upstream)]) }

/// Location blocks routed to a role's upstream; empty for roles the gateway does not expose.
fn role_locations(role: WorkerRole, scheme: &str) -> Vec<Directive> {
    let up = role.as_str();
    match role {
        WorkerRole::Distributor => ["/distributor", "/api/v1/push", "/otlp/v1/metrics"]
            .into_iter()
            .map(|p| location(&[p], scheme, up))
            .collect(),
        WorkerRole::Alertmanager => ["/alertmanager", "/multitenant_alertmanager/status", "/api/v1/alerts"]
            .into_iter()
            .map(|p| location(&[p], scheme, up))
            .collect(),
        WorkerRole::Ruler => vec![
            location(&["/prometheus/config/v1/rules"], scheme, up),
            location(&["/prometheus/api/v1/rules"], scheme, up),
            location(&["/prometheus/api/v1/alerts"], scheme, up),
            location(&["=", "/ruler/ring"], scheme, up),
        ],
        WorkerRole::QueryFrontend => vec![
            location(&["/prometheus"], scheme, up),
            location(&["=", "/api/v1/status/buildinfo"], scheme, up),
        ],
        WorkerRole::Compactor => vec![location(&["=", "/api/v1/upload/block/"], scheme, up)],
        _ => Vec::new(),
    }
}

fn basic_locations() -> Vec<Directive> {
    vec![
        b("location", &["=", "/"], vec![d("return", &["200", "'OK'"]), d("auth_basic", &["off"])]),
        b("location", &["=", "/status"], vec![d("stub_status", &[])]),
    ]
}

/// Render the gateway config: one upstream per assigned role and the matching locations.
pub fn render(assignment: &Assignment, tls: bool, server_name: &str, worker_port: u16) -> String {
    let scheme = if tls { "https" } else { "http" };

    let mut http = Vec::new();
    for (role, unit) in &assignment.by_role {
        let Some(addr) = assignment.units.get(unit).map(|u| u.address.as_str()).filter(|a| !a.is_empty()) else {
            continue;
        };
        http.push(b("upstream", &[role.as_str()], vec![d("server", &[format!("{}:{}", addr, worker_port).as_str()])]));
    }
    http.extend([
        d("client_body_temp_path", &["/tmp/client_temp"]),
        d("proxy_temp_path", &["/tmp/proxy_temp_path"]),
        d("default_type", &["application/octet-stream"]),
        b("map", &["$status", "$loggable"], vec![d("~^[23]", &["0"]), d("default", &["1"])]),
        d("access_log", &["/dev/stderr"]),
        d("sendfile", &["on"]),
        d("tcp_nopush", &["on"]),
        d("resolver", &["kube-dns.kube-system.svc.cluster.local."]),
        b(
            "map",
            &["$http_x_scope_orgid", "$ensured_x_scope_orgid"],
            vec![d("default", &["$http_x_scope_orgid"]), d("", &["anonymous"])],
        ),
        d("proxy_read_timeout", &["300"]),
    ]);

    let port = PROXY_PORT.to_string();
    let mut server = if tls {
        vec![
            d("listen", &["443", "ssl"]),
            d("listen", &["[::]:443", "ssl"]),
            d("server_name", &[server_name]),
            d("ssl_certificate", &[PROXY_CERT_PATH]),
            d("ssl_certificate_key", &[PROXY_KEY_PATH]),
            d("ssl_protocols", &["TLSv1.2", "TLSv1.3"]),
            d("ssl_ciphers", &["HIGH:!aNULL:!MD5"]),
        ]
    } else {
        vec![d("listen", &[port.as_str()]), d("listen", &[format!("[::]:{}", port).as_str()])]
    };
    server.push(d("proxy_set_header", &["X-Scope-OrgID", "$ensured_x_scope_orgid"]));
    server.extend(basic_locations());
    for role in assignment.by_role.keys() {
        server.extend(role_locations(*role, scheme));
    }
    http.push(b("server", &[], server));

    let top = vec![
        d("worker_processes", &["5"]),
        d("error_log", &["/dev/stderr", "error"]),
        d("pid", &["/tmp/nginx.pid"]),
        d("worker_rlimit_nofile", &["8192"]),
        b("events", &[], vec![d("worker_connections", &["4096"])]),
        b("http", &[], http),
    ];
    let mut out = String::new();
    write_block(&mut out, &top, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_core::AssignedUnit;

    fn assign(pairs: &[(WorkerRole, &str)]) -> Assignment {
        let mut a = Assignment::default();
        for (role, unit) in pairs {
            a.by_role.insert(*role, unit.to_string());
            a.units
                .entry(unit.to_string())
                .or_insert_with(|| AssignedUnit { address: format!("{}.local", unit), ..Default::default() })
                .roles
                .insert(*role);
        }
        a
    }

    #[test]
    fn upstreams_and_locations_follow_assignment() {
        let a = assign(&[(WorkerRole::Distributor, "w0"), (WorkerRole::Querier, "w1")]);
        let text = render(&a, false, "mimir", 8080);
        assert!(text.contains("upstream distributor {\n        server w0.local:8080;\n    }"));
        assert!(text.contains("upstream querier {"));
        assert!(text.contains("location /api/v1/push {\n            proxy_pass http://distributor;"));
        assert!(!text.contains("/prometheus/api/v1/rules"));
        assert!(text.contains("location = /status {"));
        assert!(text.contains("listen 8080;"));
        assert!(text.contains("'' anonymous;"));
    }

    #[test]
    fn tls_switches_scheme_and_listener() {
        let a = assign(&[(WorkerRole::Ruler, "w0")]);
        let text = render(&a, true, "mimir.cos.svc.cluster.local", 8080);
        assert!(text.contains("listen 443 ssl;"));
        assert!(text.contains("server_name mimir.cos.svc.cluster.local;"));
        assert!(text.contains("proxy_pass https://ruler;"));
        assert!(text.contains("location = /ruler/ring {"));
    }
}
