//! pprof structural merge. The `pprof` crate only knows how to *build* a
//! profile from its own profiler hooks, not merge two decoded ones (the
//! way `google/pprof`'s `profile.Merge` does), so the table relocation
//! and sample aggregation below is hand-written over the crate's
//! protobuf-codec generated `Profile` type. Table relocation follows the
//! same string/function/location id remapping the teacher's
//! `PProfBuilder` uses when it incrementally builds a profile.

use std::collections::HashMap;
use std::io::Read;

use common::error::{Error, Result};
use pprof::protos::{Function, Label, Line, Location, Mapping, Profile, Sample};
use protobuf::Message;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// pprof profiles are conventionally gzip-compressed; detect and
/// transparently decompress, matching `profile.Parse`'s behavior in the
/// original implementation.
pub fn decode(bytes: &[u8]) -> Result<Profile> {
    let raw = if bytes.len() >= 2 && bytes[0..2] == GZIP_MAGIC {
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::MalformedValue(format!("gzip decode failed: {e}")))?;
        out
    } else {
        bytes.to_vec()
    };
    Profile::parse_from_bytes(&raw).map_err(|e| Error::MalformedValue(format!("pprof decode failed: {e}")))
}

pub fn encode(profile: &Profile) -> Result<Vec<u8>> {
    profile
        .write_to_bytes()
        .map_err(|e| Error::Internal(format!("pprof encode failed: {e}")))
}

/// Multiplies every sample value in the profile by `factor`. Used before
/// a diff so profile A's values can be subtracted by merging it in
/// negated, matching `profile.Scale(-1)` in the original's `DiffProfiles`.
pub fn scale(profile: &mut Profile, factor: i64) {
    for sample in profile.sample.iter_mut() {
        for v in sample.value.iter_mut() {
            *v *= factor;
        }
    }
}

/// Sets (or replaces) a string label on every sample, matching
/// `profile.SetLabel("pprof::base", ...)` which the original uses to tag
/// the negated baseline profile before merging.
pub fn set_label(profile: &mut Profile, key: &str, value: &str) {
    let key_id = builder_string(profile, key);
    let value_id = builder_string(profile, value);
    for sample in profile.sample.iter_mut() {
        sample.label.retain(|l| l.key != key_id);
        let mut label = Label::new();
        label.key = key_id;
        label.str = value_id;
        sample.label.push(label);
    }
}

/// Structurally merges a list of decoded profiles into one: string,
/// function, location, and mapping tables are relocated into a fresh
/// profile, and samples with an identical stack trace (by relocated
/// location-id sequence plus label set) have their values summed.
pub fn merge(profiles: &[Profile]) -> Result<Profile> {
    if profiles.is_empty() {
        return Err(Error::BadRequest("cannot merge zero profiles".into()));
    }

    let mut out = Profile::new();
    out.string_table.push(String::new());
    out.period_type = profiles[0].period_type.clone();
    out.sample_type = profiles[0].sample_type.clone();
    out.period = profiles[0].period;
    out.time_nanos = profiles.iter().map(|p| p.time_nanos).min().unwrap_or(0);
    out.duration_nanos = profiles.iter().map(|p| p.duration_nanos).sum();

    let mut string_ids: HashMap<String, i64> = HashMap::new();
    string_ids.insert(String::new(), 0);

    let mut mapping_ids: HashMap<(i64, i64, i64), u64> = HashMap::new();
    let mut function_ids: HashMap<(i64, i64), u64> = HashMap::new();
    let mut location_ids: HashMap<(u64, Vec<(i64, i64)>), u64> = HashMap::new();
    let mut sample_index: HashMap<(Vec<u64>, Vec<(i64, i64, i64)>), usize> = HashMap::new();

    for profile in profiles {
        let string_map = relocate_strings(profile, &mut out, &mut string_ids);
        let mapping_map = relocate_mappings(profile, &mut out, &string_map, &mut mapping_ids);
        let function_map = relocate_functions(profile, &mut out, &string_map, &mut function_ids);
        let location_map =
            relocate_locations(profile, &mut out, &function_map, &mapping_map, &mut location_ids);

        for sample in &profile.sample {
            let relocated_locations: Vec<u64> = sample
                .location_id
                .iter()
                .filter_map(|id| location_map.get(id).copied())
                .collect();
            let relocated_labels: Vec<(i64, i64, i64)> = sample
                .label
                .iter()
                .map(|l| {
                    (
                        *string_map.get(&l.key).unwrap_or(&0),
                        *string_map.get(&l.str).unwrap_or(&0),
                        l.num,
                    )
                })
                .collect();
            let mut sorted_labels = relocated_labels.clone();
            sorted_labels.sort();
            let identity = (relocated_locations.clone(), sorted_labels);

            if let Some(&idx) = sample_index.get(&identity) {
                for (i, v) in sample.value.iter().enumerate() {
                    if let Some(existing) = out.sample[idx].value.get_mut(i) {
                        *existing += v;
                    }
                }
                continue;
            }

            let mut new_sample = Sample::new();
            new_sample.location_id = relocated_locations;
            new_sample.value = sample.value.clone();
            new_sample.label = sample
                .label
                .iter()
                .map(|l| {
                    let mut nl = Label::new();
                    nl.key = *string_map.get(&l.key).unwrap_or(&0);
                    nl.str = *string_map.get(&l.str).unwrap_or(&0);
                    nl.num = l.num;
                    nl
                })
                .collect();
            sample_index.insert(identity, out.sample.len());
            out.sample.push(new_sample);
        }
    }

    Ok(out)
}

fn builder_string(profile: &mut Profile, s: &str) -> i64 {
    if let Some(pos) = profile.string_table.iter().position(|v| v == s) {
        return pos as i64;
    }
    let id = profile.string_table.len() as i64;
    profile.string_table.push(s.to_string());
    id
}

fn relocate_strings(src: &Profile, dst: &mut Profile, ids: &mut HashMap<String, i64>) -> HashMap<i64, i64> {
    let mut map = HashMap::with_capacity(src.string_table.len());
    for (i, s) in src.string_table.iter().enumerate() {
        let id = *ids.entry(s.clone()).or_insert_with(|| {
            let id = dst.string_table.len() as i64;
            dst.string_table.push(s.clone());
            id
        });
        map.insert(i as i64, id);
    }
    map
}

fn relocate_mappings(
    src: &Profile,
    dst: &mut Profile,
    strings: &HashMap<i64, i64>,
    ids: &mut HashMap<(i64, i64, i64), u64>,
) -> HashMap<u64, u64> {
    let mut map = HashMap::with_capacity(src.mapping.len());
    for m in &src.mapping {
        let filename = *strings.get(&m.filename).unwrap_or(&0);
        let build_id = *strings.get(&m.build_id).unwrap_or(&0);
        let key = (m.memory_start as i64, filename, build_id);
        let id = *ids.entry(key).or_insert_with(|| {
            let id = dst.mapping.len() as u64 + 1;
            let mut nm = Mapping::new();
            nm.id = id;
            nm.memory_start = m.memory_start;
            nm.memory_limit = m.memory_limit;
            nm.file_offset = m.file_offset;
            nm.filename = filename;
            nm.build_id = build_id;
            dst.mapping.push(nm);
            id
        });
        map.insert(m.id, id);
    }
    map
}

fn relocate_functions(
    src: &Profile,
    dst: &mut Profile,
    strings: &HashMap<i64, i64>,
    ids: &mut HashMap<(i64, i64), u64>,
) -> HashMap<u64, u64> {
    let mut map = HashMap::with_capacity(src.function.len());
    for f in &src.function {
        let name = *strings.get(&f.name).unwrap_or(&0);
        let filename = *strings.get(&f.filename).unwrap_or(&0);
        let id = *ids.entry((name, filename)).or_insert_with(|| {
            let id = dst.function.len() as u64 + 1;
            let mut nf = Function::new();
            nf.id = id;
            nf.name = name;
            nf.system_name = *strings.get(&f.system_name).unwrap_or(&0);
            nf.filename = filename;
            nf.start_line = f.start_line;
            dst.function.push(nf);
            id
        });
        map.insert(f.id, id);
    }
    map
}

fn relocate_locations(
    src: &Profile,
    dst: &mut Profile,
    functions: &HashMap<u64, u64>,
    mappings: &HashMap<u64, u64>,
    ids: &mut HashMap<(u64, Vec<(i64, i64)>), u64>,
) -> HashMap<u64, u64> {
    let mut map = HashMap::with_capacity(src.location.len());
    for l in &src.location {
        let mapping_id = mappings.get(&l.mapping_id).copied().unwrap_or(0);
        let lines: Vec<(i64, i64)> = l
            .line
            .iter()
            .map(|line| (*functions.get(&line.function_id).unwrap_or(&0) as i64, line.line))
            .collect();
        let key = (mapping_id, lines.clone());
        let id = *ids.entry(key).or_insert_with(|| {
            let id = dst.location.len() as u64 + 1;
            let mut nl = Location::new();
            nl.id = id;
            nl.mapping_id = mapping_id;
            nl.address = l.address;
            nl.line = lines
                .iter()
                .map(|(fid, ln)| {
                    let mut line = Line::new();
                    line.function_id = *fid as u64;
                    line.line = *ln;
                    line
                })
                .collect();
            dst.location.push(nl);
            id
        });
        map.insert(l.id, id);
    }
    map
}
