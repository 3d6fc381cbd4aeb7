use std::fs;
use std::path::Path;

// Sources on the resolution path. None of them may reach the system resolver,
// otherwise lookups could be answered from a cache and never hit the router.
const RESOLUTION_PATH: &[&str] = &[
    "src/dns.rs",
    "src/dns_resolver.rs",
    "src/dialer.rs",
    "src/proxy.rs",
    "src/socks5.rs",
];

fn main() {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing");
    for file in RESOLUTION_PATH {
        let path = Path::new(&manifest_dir).join(file);
        println!("cargo:rerun-if-changed={}", path.display());
        if let Ok(contents) = fs::read_to_string(&path) {
            enforce_no_system_resolver(&contents, &path);
        }
    }
}

fn enforce_no_system_resolver(contents: &str, path: &Path) {
    let forbidden = [
        "to_socket_addrs",
        "ToSocketAddrs",
        "lookup_host",
        "getaddrinfo",
    ];

    for token in forbidden {
        if contents.contains(token) {
            panic!(
                "Forbidden token `{}` on the router-pinned resolution path: {}",
                token,
                path.display()
            );
        }
    }
}
