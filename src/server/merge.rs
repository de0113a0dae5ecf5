//! Merging per-source configurations into one routing table.
//!
//! Every local name becomes `name@source`; routers without entry points
//! inherit the default set; TLS `default` stores/options follow the
//! at-most-once rule; entry-point models are expanded onto routers after
//! the merge.

use crate::config::dynamic::{
    Configuration, Configurations, TlsOptions, DEFAULT_TLS_OPTIONS_NAME, DEFAULT_TLS_STORE_NAME,
};
use crate::provider::{make_qualified_name, ACME_TLS1_SOURCE, INTERNAL_PROVIDER_NAME};
use tracing::{debug, error};

/// Merge the last configuration of every source into a single one with
/// globally unique qualified names.
pub fn merge_configuration(
    configurations: &Configurations,
    default_entry_points: &[String],
) -> Configuration {
    let mut conf = Configuration::default();

    let mut default_tls_options_sources: Vec<String> = Vec::new();
    let mut default_tls_store_sources: Vec<String> = Vec::new();

    // Iterate sources in a fixed order so merge conflicts resolve the same
    // way on every run.
    let mut sources: Vec<&String> = configurations.keys().collect();
    sources.sort();

    for source in sources {
        let configuration = &configurations[source];

        for (name, router) in &configuration.http.routers {
            let mut router = router.clone();
            if router.entry_points.is_empty() {
                debug!(
                    router = name.as_str(),
                    "No entryPoint defined for this router, using the default one(s) instead: {:?}",
                    default_entry_points
                );
                router.entry_points = default_entry_points.to_vec();
            }
            conf.http
                .routers
                .insert(make_qualified_name(source, name), router);
        }
        for (name, middleware) in &configuration.http.middlewares {
            conf.http
                .middlewares
                .insert(make_qualified_name(source, name), middleware.clone());
        }
        for (name, service) in &configuration.http.services {
            conf.http
                .services
                .insert(make_qualified_name(source, name), service.clone());
        }
        for (name, model) in &configuration.http.models {
            conf.http
                .models
                .insert(make_qualified_name(source, name), model.clone());
        }
        for (name, transport) in &configuration.http.servers_transports {
            conf.http
                .servers_transports
                .insert(make_qualified_name(source, name), transport.clone());
        }

        for (name, router) in &configuration.tcp.routers {
            let mut router = router.clone();
            if router.entry_points.is_empty() {
                debug!(
                    router = name.as_str(),
                    "No entryPoint defined for this TCP router, using the default one(s) instead: {:?}",
                    default_entry_points
                );
                router.entry_points = default_entry_points.to_vec();
            }
            conf.tcp
                .routers
                .insert(make_qualified_name(source, name), router);
        }
        for (name, middleware) in &configuration.tcp.middlewares {
            conf.tcp
                .middlewares
                .insert(make_qualified_name(source, name), middleware.clone());
        }
        for (name, service) in &configuration.tcp.services {
            conf.tcp
                .services
                .insert(make_qualified_name(source, name), service.clone());
        }

        for (name, router) in &configuration.udp.routers {
            conf.udp
                .routers
                .insert(make_qualified_name(source, name), router.clone());
        }
        for (name, service) in &configuration.udp.services {
            conf.udp
                .services
                .insert(make_qualified_name(source, name), service.clone());
        }

        for cert in &configuration.tls.certificates {
            // TLS-ALPN challenge certificates are only admitted from the
            // internal ACME source.
            if cert.is_acme_tls1() && source != ACME_TLS1_SOURCE {
                continue;
            }
            conf.tls.certificates.push(cert.clone());
        }

        for (name, store) in &configuration.tls.stores {
            if name == DEFAULT_TLS_STORE_NAME {
                default_tls_store_sources.push(source.clone());
                conf.tls.stores.insert(name.clone(), store.clone());
            } else {
                conf.tls
                    .stores
                    .insert(make_qualified_name(source, name), store.clone());
            }
        }

        for (name, options) in &configuration.tls.options {
            if name == DEFAULT_TLS_OPTIONS_NAME {
                default_tls_options_sources.push(source.clone());
                conf.tls.options.insert(name.clone(), options.clone());
            } else {
                conf.tls
                    .options
                    .insert(make_qualified_name(source, name), options.clone());
            }
        }
    }

    if default_tls_store_sources.len() > 1 {
        error!(
            "Default TLS Stores defined multiple times in {:?}",
            default_tls_store_sources
        );
        conf.tls.stores.remove(DEFAULT_TLS_STORE_NAME);
    }

    if default_tls_options_sources.is_empty() {
        conf.tls
            .options
            .insert(DEFAULT_TLS_OPTIONS_NAME.to_string(), TlsOptions::default());
    } else if default_tls_options_sources.len() > 1 {
        error!(
            "Default TLS Options defined multiple times in {:?}",
            default_tls_options_sources
        );
        // Deliberately no empty fallback here: routers depending on the
        // missing default option fail to initialize as well (cascading
        // failure), which surfaces the conflict instead of hiding it.
        conf.tls.options.remove(DEFAULT_TLS_OPTIONS_NAME);
    }

    conf
}

/// Expand per-entry-point models onto HTTP routers.
///
/// For each entry point of a router for which a model `ep@internal` exists,
/// a copy of the router with that entry point alone is produced; the model's
/// TLS applies when the router had none and the model's middlewares are
/// prepended. The copy is named `ep-originalName` when the router spanned
/// several entry points.
pub fn apply_model(mut cfg: Configuration) -> Configuration {
    if cfg.http.models.is_empty() {
        return cfg;
    }

    let mut routers = std::collections::HashMap::new();

    for (name, router) in &cfg.http.routers {
        let mut passthrough = router.clone();
        let entry_points = std::mem::take(&mut passthrough.entry_points);

        for ep_name in &entry_points {
            let model_name = format!("{}@{}", ep_name, INTERNAL_PROVIDER_NAME);
            match cfg.http.models.get(&model_name) {
                Some(model) => {
                    let mut copy = passthrough.clone();
                    copy.entry_points = vec![ep_name.clone()];

                    if copy.tls.is_none() {
                        copy.tls = model.tls.clone();
                    }

                    let mut middlewares = model.middlewares.clone();
                    middlewares.extend(copy.middlewares);
                    copy.middlewares = middlewares;

                    let router_name = if entry_points.len() > 1 {
                        format!("{}-{}", ep_name, name)
                    } else {
                        name.clone()
                    };
                    routers.insert(router_name, copy);
                }
                None => {
                    let entry = routers
                        .entry(name.clone())
                        .or_insert_with(|| passthrough.clone());
                    entry.entry_points.push(ep_name.clone());
                }
            }
        }
    }

    cfg.http.routers = routers;
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::dynamic::*;

    fn configuration_with_router(name: &str, entry_points: Vec<&str>) -> Configuration {
        let mut conf = Configuration::default();
        conf.http.routers.insert(
            name.to_string(),
            Router {
                rule: "Host(`example.com`)".to_string(),
                entry_points: entry_points.into_iter().map(String::from).collect(),
                service: "svc".to_string(),
                ..Default::default()
            },
        );
        conf
    }

    #[test]
    fn test_merge_qualifies_names() {
        let mut configurations = Configurations::new();
        configurations.insert("file".to_string(), configuration_with_router("web", vec!["ep"]));
        configurations.insert("docker".to_string(), configuration_with_router("web", vec!["ep"]));

        let merged = merge_configuration(&configurations, &[]);
        assert_eq!(merged.http.routers.len(), 2);
        assert!(merged.http.routers.contains_key("web@file"));
        assert!(merged.http.routers.contains_key("web@docker"));
    }

    #[test]
    fn test_merge_applies_default_entry_points() {
        let mut configurations = Configurations::new();
        configurations.insert("file".to_string(), configuration_with_router("web", vec![]));

        let merged = merge_configuration(&configurations, &["web".to_string()]);
        assert_eq!(merged.http.routers["web@file"].entry_points, vec!["web"]);
    }

    #[test]
    fn test_merge_acme_tls1_certificates_filtered() {
        let mut file_conf = Configuration::default();
        file_conf.tls.certificates.push(CertificateConfig {
            cert_file: "file.pem".to_string(),
            key_file: "file.key".to_string(),
            stores: vec![ACME_TLS1_PROTOCOL.to_string()],
        });

        let mut acme_conf = Configuration::default();
        acme_conf.tls.certificates.push(CertificateConfig {
            cert_file: "acme.pem".to_string(),
            key_file: "acme.key".to_string(),
            stores: vec![ACME_TLS1_PROTOCOL.to_string()],
        });

        let mut configurations = Configurations::new();
        configurations.insert("file".to_string(), file_conf);
        configurations.insert("tlsalpn.acme".to_string(), acme_conf);

        let merged = merge_configuration(&configurations, &[]);
        assert_eq!(merged.tls.certificates.len(), 1);
        assert_eq!(merged.tls.certificates[0].cert_file, "acme.pem");
    }

    #[test]
    fn test_merge_conflicting_default_tls_options_removed() {
        let mut conf_a = Configuration::default();
        conf_a
            .tls
            .options
            .insert("default".to_string(), TlsOptions::default());
        let mut conf_b = Configuration::default();
        conf_b
            .tls
            .options
            .insert("default".to_string(), TlsOptions::default());

        let mut configurations = Configurations::new();
        configurations.insert("a".to_string(), conf_a);
        configurations.insert("b".to_string(), conf_b);

        let merged = merge_configuration(&configurations, &[]);
        assert!(!merged.tls.options.contains_key("default"));
    }

    #[test]
    fn test_merge_synthesizes_default_tls_options() {
        let configurations = Configurations::new();
        let merged = merge_configuration(&configurations, &[]);
        assert!(merged.tls.options.contains_key("default"));
    }

    #[test]
    fn test_apply_model_single_entry_point_keeps_name() {
        let mut cfg = Configuration::default();
        cfg.http.routers.insert(
            "web@file".to_string(),
            Router {
                rule: "Host(`a`)".to_string(),
                entry_points: vec!["ep".to_string()],
                service: "svc".to_string(),
                middlewares: vec!["own".to_string()],
                ..Default::default()
            },
        );
        cfg.http.models.insert(
            "ep@internal".to_string(),
            Model {
                middlewares: vec!["model-mw".to_string()],
                tls: Some(RouterTlsConfig::default()),
            },
        );

        let out = apply_model(cfg);
        let router = &out.http.routers["web@file"];
        assert_eq!(router.entry_points, vec!["ep"]);
        assert_eq!(router.middlewares, vec!["model-mw", "own"]);
        assert!(router.tls.is_some());
    }

    #[test]
    fn test_apply_model_multi_entry_point_prefixes_name() {
        let mut cfg = Configuration::default();
        cfg.http.routers.insert(
            "web@file".to_string(),
            Router {
                rule: "Host(`a`)".to_string(),
                entry_points: vec!["ep1".to_string(), "ep2".to_string()],
                service: "svc".to_string(),
                ..Default::default()
            },
        );
        cfg.http
            .models
            .insert("ep1@internal".to_string(), Model::default());
        cfg.http
            .models
            .insert("ep2@internal".to_string(), Model::default());

        let out = apply_model(cfg);
        assert_eq!(out.http.routers.len(), 2);
        assert_eq!(out.http.routers["ep1-web@file"].entry_points, vec!["ep1"]);
        assert_eq!(out.http.routers["ep2-web@file"].entry_points, vec!["ep2"]);
    }

    #[test]
    fn test_apply_model_preserves_router_entry_point_pairs() {
        // Expansion preserves the union of {router x entry point} pairs.
        let mut cfg = Configuration::default();
        cfg.http.routers.insert(
            "a@file".to_string(),
            Router {
                rule: "Host(`a`)".to_string(),
                entry_points: vec!["ep1".to_string(), "ep2".to_string()],
                service: "svc".to_string(),
                ..Default::default()
            },
        );
        cfg.http.routers.insert(
            "b@file".to_string(),
            Router {
                rule: "Host(`b`)".to_string(),
                entry_points: vec!["ep1".to_string()],
                service: "svc".to_string(),
                ..Default::default()
            },
        );
        cfg.http
            .models
            .insert("ep1@internal".to_string(), Model::default());

        let before: usize = cfg
            .http
            .routers
            .values()
            .map(|r| r.entry_points.len())
            .sum();

        let out = apply_model(cfg);
        let after: usize = out
            .http
            .routers
            .values()
            .map(|r| r.entry_points.len())
            .sum();
        assert_eq!(before, after);
        // ep2 has no model; the a-router copy for it passes through.
        assert!(out
            .http
            .routers
            .values()
            .any(|r| r.entry_points == vec!["ep2"]));
    }

    #[test]
    fn test_router_tls_wins_over_model_tls() {
        let mut cfg = Configuration::default();
        cfg.http.routers.insert(
            "web@file".to_string(),
            Router {
                rule: "Host(`a`)".to_string(),
                entry_points: vec!["ep".to_string()],
                service: "svc".to_string(),
                tls: Some(RouterTlsConfig {
                    options: "custom@file".to_string(),
                    passthrough: false,
                }),
                ..Default::default()
            },
        );
        cfg.http.models.insert(
            "ep@internal".to_string(),
            Model {
                middlewares: vec![],
                tls: Some(RouterTlsConfig {
                    options: "model".to_string(),
                    passthrough: false,
                }),
            },
        );

        let out = apply_model(cfg);
        assert_eq!(
            out.http.routers["web@file"].tls.as_ref().unwrap().options,
            "custom@file"
        );
    }
}
