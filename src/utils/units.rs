#[allow(non_upper_case_globals)]
pub const B: usize = 1;
#[allow(non_upper_case_globals)]
pub const KiB: usize = 1024 * B;
#[allow(non_upper_case_globals)]
pub const MiB: usize = 1024 * KiB;
#[allow(non_upper_case_globals)]
pub const GiB: usize = 1024 * MiB;

const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

pub fn display_size(size: usize) -> String {
	let width = size.ilog2();
	let unit = width / 10;
	let unit_name = UNITS[unit as usize];
	let decimal_pos = unit * 10;
	let converted = (size as f64) / ((1 << decimal_pos) as f64);
	format!("{converted} {unit_name}")
}
