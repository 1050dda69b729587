//! What a loaded plugin can and cannot reach: host symbols through its
//! isolated loader, and files through its resource accessor.

mod common;

use common::{Harness, capturing_plugin, context};
use plexus_plugins::testing::PackageBuilder;
use plexus_plugins::{Permission, PluginError};

const ALL_PERMISSIONS: [&str; 6] = [
    "filesystem.read",
    "filesystem.write",
    "network.access",
    "system.commands",
    "ide.settings",
    "project.structure",
];

#[test]
fn network_symbols_follow_network_permission() {
    let h = Harness::new();
    let (offline, offline_ctx) = capturing_plugin();
    let (online, online_ctx) = capturing_plugin();
    h.manager
        .load_plugin(&h.write("offline", &offline, PackageBuilder::new("offline")))
        .unwrap();
    h.manager
        .load_plugin(&h.write(
            "online",
            &online,
            PackageBuilder::new("online").permission("network.access"),
        ))
        .unwrap();

    let err = context(&offline_ctx)
        .resolve("std.net.TcpStream")
        .unwrap_err();
    assert!(
        matches!(err, PluginError::AccessDenied { ref symbol, .. } if symbol == "std.net.TcpStream")
    );
    assert!(err.is_security_event());

    let resolved = context(&online_ctx).resolve("std.net.TcpStream").unwrap();
    assert!(resolved.as_host().is_some());
}

#[test]
fn reserved_namespaces_stay_closed_with_every_permission() {
    let h = Harness::new();
    let (plugin, slot) = capturing_plugin();
    let builder = ALL_PERMISSIONS
        .iter()
        .fold(PackageBuilder::new("privileged"), |b, p| b.permission(p));
    h.manager
        .load_plugin(&h.write("privileged", &plugin, builder))
        .unwrap();
    let ctx = context(&slot);
    assert_eq!(ctx.permissions().len(), Permission::ALL.len());

    for symbol in [
        "std.os.unix.process.CommandExt",
        "runtime.Scheduler",
        "host.internal.Database",
        "std.ptr.write",
        "std.env.set_var",
        "libloading.Library",
    ] {
        assert!(
            matches!(ctx.resolve(symbol), Err(PluginError::AccessDenied { .. })),
            "{symbol} should be denied"
        );
    }
}

#[test]
fn host_public_api_needs_no_permission() {
    let h = Harness::new();
    let (plugin, slot) = capturing_plugin();
    h.manager
        .load_plugin(&h.write("plain", &plugin, PackageBuilder::new("plain")))
        .unwrap();
    let ctx = context(&slot);

    // Allowed by the gate but provided by no one.
    assert!(matches!(
        ctx.resolve("host.api.Missing"),
        Err(PluginError::SymbolNotFound { .. })
    ));
    // The plugin's own entry point resolves from its package.
    assert!(ctx.resolve("plain.Main").unwrap().as_module().is_some());
}

#[test]
fn unknown_permission_fails_before_any_loader_exists() {
    let h = Harness::new();
    let (plugin, _) = capturing_plugin();
    let path = h.write(
        "greedy",
        &plugin,
        PackageBuilder::new("greedy").permission("delete.everything"),
    );

    let err = h.manager.load_plugin(&path).unwrap_err();
    assert!(matches!(err, PluginError::UnknownPermission(ref p) if p == "delete.everything"));
    assert_eq!(h.manager.loader_stats().created(), 0);
    assert!(plugin.log().calls().is_empty());
}

#[test]
fn private_directory_confines_writes() {
    let h = Harness::new();
    let (writer, writer_slot) = capturing_plugin();
    let (reader, reader_slot) = capturing_plugin();
    h.manager
        .load_plugin(&h.write(
            "writer",
            &writer,
            PackageBuilder::new("writer").permission("filesystem.write"),
        ))
        .unwrap();
    h.manager
        .load_plugin(&h.write("reader", &reader, PackageBuilder::new("reader")))
        .unwrap();

    let writer_ctx = context(&writer_slot);
    let resources = writer_ctx.resources();
    resources.write("cache/state.json", b"{}").unwrap();
    assert_eq!(resources.read_to_string("cache/state.json").unwrap(), "{}");
    assert!(resources.plugin_dir().join("cache/state.json").is_file());

    for escape in ["../reader/data/x", "../../outside.txt", "/etc/passwd"] {
        assert!(
            matches!(
                resources.write(escape, b"x"),
                Err(PluginError::PathTraversalDenied { .. })
            ),
            "{escape} should be outside the private directory"
        );
    }

    let reader_ctx = context(&reader_slot);
    let readonly = reader_ctx.resources();
    assert!(matches!(
        readonly.write("note.txt", b"x"),
        Err(PluginError::AccessDenied { .. })
    ));
    // Containment is checked before permissions.
    assert!(matches!(
        readonly.write("../writer/data/cache/state.json", b"x"),
        Err(PluginError::PathTraversalDenied { .. })
    ));
    assert!(!readonly.exists("cache/state.json").unwrap());
}

#[test]
fn bundled_resources_are_read_from_the_package() {
    let h = Harness::new();
    let (plugin, slot) = capturing_plugin();
    h.manager
        .load_plugin(&h.write(
            "assets",
            &plugin,
            PackageBuilder::new("assets").resource("templates/hello.txt", "hello"),
        ))
        .unwrap();
    let ctx = context(&slot);

    assert_eq!(
        ctx.resources().bundled_resource("templates/hello.txt").unwrap(),
        b"hello"
    );
    assert_eq!(ctx.loader().read_resource("templates/hello.txt").unwrap(), b"hello");
}

#[test]
fn loader_closes_on_unload() {
    let h = Harness::new();
    let (plugin, slot) = capturing_plugin();
    let id = h
        .manager
        .load_plugin(&h.write("closing", &plugin, PackageBuilder::new("closing")))
        .unwrap();
    let ctx = context(&slot);
    assert!(ctx.resolve("closing.Main").is_ok());

    h.manager.unload_plugin(&id);
    assert!(ctx.loader().is_closed());
    assert!(matches!(
        ctx.resolve("closing.Main"),
        Err(PluginError::LoaderClosed(_))
    ));
}
