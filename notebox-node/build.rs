fn main() {
    embuild::espidf::sysenv::output();

    // NOTEBOX_PROFILE / NOTEBOX_DEVICE_NAME from .env become option_env! values.
    println!("cargo::rerun-if-changed=.env");
    if let Ok(iter) = dotenvy::dotenv_iter() {
        for (key, val) in iter.flatten() {
            if key.starts_with("NOTEBOX_") {
                println!("cargo::rustc-env={}={}", key, val);
            }
        }
    }
}
