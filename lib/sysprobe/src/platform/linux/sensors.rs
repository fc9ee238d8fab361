//! Batteries from `/sys/class/power_supply`, temperatures from `/sys/class/hwmon`.

use std::{
    fs,
    path::{Path, PathBuf},
};

use super::PlatformImpl;
use crate::{
    error::Result,
    types::{Battery, BatteryTime, Temperature, Temperatures},
};

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|text| text.trim().to_string())
}

fn read_number(path: &Path) -> Option<f64> {
    read_trimmed(path)?.parse().ok()
}

/// Reads the first of several alternative attribute files that exists.
fn first_number(dir: &Path, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|name| read_number(&dir.join(name)))
}

fn supplies(platform: &PlatformImpl) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(platform.sysfs.join("class/power_supply")) else {
        return Vec::new();
    };
    let mut paths = entries.filter_map(|entry| entry.ok()).map(|entry| entry.path()).collect::<Vec<_>>();
    paths.sort();
    paths
}

pub(super) fn battery(platform: &PlatformImpl) -> Result<Option<Battery>> {
    let supplies = supplies(platform);
    let is_battery = |path: &PathBuf| read_trimmed(&path.join("type")).as_deref() == Some("Battery");
    let Some(battery) = supplies.iter().find(|path| is_battery(path)) else {
        return Ok(None);
    };

    // Charge is reported either as energy (µWh) or as charge (µAh), depending on the driver.
    let now = first_number(battery, &["energy_now", "charge_now"]);
    let full = first_number(battery, &["energy_full", "charge_full"]);
    let percent = match (now, full) {
        (Some(now), Some(full)) if full > 0.0 => (now / full * 100.0).min(100.0),
        _ => match read_number(&battery.join("capacity")) {
            Some(capacity) => capacity,
            // A battery that reports nothing usable is treated as absent.
            None => return Ok(None),
        },
    };

    let mains_online = supplies
        .iter()
        .filter(|path| !is_battery(path))
        .find_map(|path| read_number(&path.join("online")))
        .map(|online| online != 0.0);
    let power_plugged = mains_online.or_else(|| match read_trimmed(&battery.join("status"))?.to_lowercase().as_str() {
        "charging" | "full" => Some(true),
        "discharging" => Some(false),
        _ => None,
    });

    let rate = first_number(battery, &["power_now", "current_now"]);
    let secs_left = match (power_plugged, now, rate) {
        (Some(true), _, _) => BatteryTime::Unlimited,
        (_, Some(now), Some(rate)) if rate > 0.0 => BatteryTime::Seconds((now / rate * 3600.0) as u64),
        _ => BatteryTime::Unknown,
    };

    Ok(Some(Battery {
        percent,
        secs_left,
        power_plugged,
    }))
}

pub(super) fn temperatures(platform: &PlatformImpl) -> Result<Temperatures> {
    let mut temperatures = Temperatures::new();
    let Ok(entries) = fs::read_dir(platform.sysfs.join("class/hwmon")) else {
        return Ok(temperatures);
    };

    for hwmon in entries.filter_map(|entry| entry.ok()).map(|entry| entry.path()) {
        // Older drivers put their attributes under `device/`.
        let dir = if hwmon.join("name").exists() { hwmon.clone() } else { hwmon.join("device") };
        let Some(name) = read_trimmed(&dir.join("name")) else {
            continue;
        };
        let Ok(files) = fs::read_dir(&dir) else {
            continue;
        };

        let mut inputs = files
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file = entry.file_name().to_string_lossy().into_owned();
                let prefix = file.strip_suffix("_input")?;
                prefix.starts_with("temp").then(|| prefix.to_string())
            })
            .collect::<Vec<_>>();
        inputs.sort();

        for prefix in inputs {
            let millidegrees = |suffix: &str| read_number(&dir.join(format!("{}_{}", prefix, suffix))).map(|v| v / 1000.0);
            let Some(current) = millidegrees("input") else {
                continue;
            };
            temperatures.entry(name.clone()).or_default().push(Temperature {
                label: read_trimmed(&dir.join(format!("{}_label", prefix))).unwrap_or_default(),
                current,
                high: millidegrees("max"),
                critical: millidegrees("crit"),
            });
        }
    }

    Ok(temperatures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BindingContext;

    fn write(path: PathBuf, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn fixture_platform(root: &Path) -> PlatformImpl {
        PlatformImpl::new(BindingContext::builder().procfs_root(root.join("proc")).build())
    }

    #[test]
    fn discharging_battery() {
        let dir = tempfile::tempdir().unwrap();
        let supply = dir.path().join("sys/class/power_supply");
        write(supply.join("BAT0/type"), "Battery\n");
        write(supply.join("BAT0/energy_now"), "25000000\n");
        write(supply.join("BAT0/energy_full"), "50000000\n");
        write(supply.join("BAT0/power_now"), "10000000\n");
        write(supply.join("BAT0/status"), "Discharging\n");
        write(supply.join("AC/type"), "Mains\n");
        write(supply.join("AC/online"), "0\n");

        let battery = battery(&fixture_platform(dir.path())).unwrap().unwrap();
        assert_eq!(battery.percent, 50.0);
        assert_eq!(battery.power_plugged, Some(false));
        assert_eq!(battery.secs_left, BatteryTime::Seconds(9000));
    }

    #[test]
    fn plugged_battery_from_status() {
        let dir = tempfile::tempdir().unwrap();
        let supply = dir.path().join("sys/class/power_supply");
        write(supply.join("BAT1/type"), "Battery\n");
        write(supply.join("BAT1/capacity"), "80\n");
        write(supply.join("BAT1/status"), "Charging\n");

        let battery = battery(&fixture_platform(dir.path())).unwrap().unwrap();
        assert_eq!(battery.percent, 80.0);
        assert_eq!(battery.secs_left, BatteryTime::Unlimited);
    }

    #[test]
    fn no_battery() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(battery(&fixture_platform(dir.path())).unwrap(), None);
    }

    #[test]
    fn hwmon_temperatures() {
        let dir = tempfile::tempdir().unwrap();
        let hwmon = dir.path().join("sys/class/hwmon/hwmon0");
        write(hwmon.join("name"), "coretemp\n");
        write(hwmon.join("temp1_input"), "45000\n");
        write(hwmon.join("temp1_label"), "Package id 0\n");
        write(hwmon.join("temp1_max"), "80000\n");
        write(hwmon.join("temp1_crit"), "100000\n");
        write(hwmon.join("temp2_input"), "43500\n");

        let temperatures = temperatures(&fixture_platform(dir.path())).unwrap();
        let coretemp = &temperatures["coretemp"];
        assert_eq!(coretemp.len(), 2);
        assert_eq!(coretemp[0].label, "Package id 0");
        assert_eq!(coretemp[0].current, 45.0);
        assert_eq!(coretemp[0].high, Some(80.0));
        assert_eq!(coretemp[0].critical, Some(100.0));
        assert_eq!(coretemp[1].label, "");
        assert_eq!(coretemp[1].current, 43.5);
    }
}
