use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every guarded value in this crate is left consistent between statements,
/// so a panic elsewhere never invalidates it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read a sysfs attribute, trimmed. `Ok(None)` if the attribute does not exist.
pub(crate) fn read_attr(dir: &Path, name: &str) -> io::Result<Option<String>> {
    match fs::read_to_string(dir.join(name)) {
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Read a hexadecimal sysfs attribute such as `idVendor`
pub(crate) fn read_hex_attr(dir: &Path, name: &str) -> io::Result<Option<u16>> {
    Ok(read_attr(dir, name)?.and_then(|value| u16::from_str_radix(&value, 16).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let poisoner = Arc::clone(&mutex);
        let _ = thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }

    #[test]
    fn test_read_attrs() {
        let dir = std::env::temp_dir().join(format!("robocam-utils-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("idVendor"), "046d\n").unwrap();
        fs::write(dir.join("serial"), "  ABC123 \n").unwrap();

        assert_eq!(read_hex_attr(&dir, "idVendor").unwrap(), Some(0x046d));
        assert_eq!(read_attr(&dir, "serial").unwrap().as_deref(), Some("ABC123"));
        assert_eq!(read_attr(&dir, "missing").unwrap(), None);

        fs::remove_dir_all(&dir).unwrap();
    }
}
