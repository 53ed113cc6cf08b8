//! Nginx configuration templates.
//!
//! Both variants are compiled into the binary and rendered through Tera. The
//! `.conf` template names keep Tera's HTML autoescaping off.

use tera::Tera;

pub const BOOTSTRAP_TEMPLATE: &str = "bootstrap.conf";
pub const SERVED_TEMPLATE: &str = "served.conf";

/// TLS 1.2 suites; TLS 1.3 suites are not configurable through `ssl_ciphers`.
pub const SSL_CIPHERS: &str = "ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-GCM-SHA256:\
ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-RSA-AES256-GCM-SHA384:\
ECDHE-ECDSA-CHACHA20-POLY1305:ECDHE-RSA-CHACHA20-POLY1305:\
DHE-RSA-AES128-GCM-SHA256:DHE-RSA-AES256-GCM-SHA384:DHE-RSA-CHACHA20-POLY1305";

pub const SSL_PROTOCOLS: &str = "TLSv1.2 TLSv1.3";

/// HSTS max-age (15768000 seconds = 6 months)
pub const HSTS_MAX_AGE: u32 = 15768000;

/// Resolvers used to reach the OCSP responder
pub const OCSP_RESOLVERS: &str = "8.8.4.4 8.8.8.8";

const BOOTSTRAP: &str = r#"server {
    listen {{ listen }};
    server_name _;

    location / {
        proxy_pass {{ upstream }};
    }
}
"#;

const SERVED: &str = r#"server {
    listen 443 ssl http2;
    listen [::]:443 ssl http2;
    server_name {{ domain }};

    ssl_session_timeout 1d;
    ssl_session_cache shared:SSL:50m;
    ssl_session_tickets off;
    ssl_certificate {{ full_chain }};
    ssl_certificate_key {{ private_key }};
    ssl_trusted_certificate {{ chain }};

    ssl_protocols {{ protocols }};
    ssl_ciphers '{{ ciphers }}';
    ssl_prefer_server_ciphers off;

    # fetch OCSP records from URL in ssl_certificate and cache them
    ssl_stapling on;
    ssl_stapling_verify on;

    ssl_dhparam {{ dhparam }};

    add_header Strict-Transport-Security max-age={{ hsts_max_age }};

    resolver {{ resolvers }};
{%- if include %}

    # Operator fragments; directives duplicated from above are an nginx error.
    include {{ include }};
{%- endif %}
}
"#;

/// Build the template engine with both configuration variants registered.
pub fn init_templates() -> Result<Tera, tera::Error> {
    let mut tera = Tera::default();
    tera.add_raw_templates(vec![(BOOTSTRAP_TEMPLATE, BOOTSTRAP), (SERVED_TEMPLATE, SERVED)])?;
    Ok(tera)
}
