use cfg_aliases::cfg_aliases;

fn main() {
    cfg_aliases! {
        std_io: { all(feature = "std", any(target_os = "windows", target_os = "linux", target_os = "macos")) },
    }
}
