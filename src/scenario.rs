//! Scenario configuration.
//!
//! [`ScenarioVariables`] is built once per run from the guild table, the
//! biophysical table, and the optional farm vector. Season and substrate
//! names are discovered by column-name pattern matching, cross-referenced
//! between the tables, and normalized, so by the time a pipeline wires its
//! task graph every coefficient lookup is guaranteed to succeed. All
//! validation happens here, before a single task is scheduled.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::Utf8Path;

use crate::error::{ConfigError, TableKind};
use crate::vector::FarmVector;

const NESTING_SUITABILITY_PREFIX: &str = "nesting_suitability_";
const FORAGING_ACTIVITY_PREFIX: &str = "foraging_activity_";
const NESTING_AVAILABILITY_PREFIX: &str = "nesting_";
const NESTING_AVAILABILITY_SUFFIX: &str = "_availability_index";
const FLORAL_RESOURCES_PREFIX: &str = "floral_resources_";
const INDEX_SUFFIX: &str = "_index";

/// Tolerance for the normalization invariants on relative abundance and
/// foraging activity.
pub const NORMALIZATION_TOLERANCE: f64 = 1e-6;

/// Validated per-run coefficients, cross-referenced across the input tables.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioVariables {
    /// Species in lexical order.
    pub species: Vec<String>,
    /// Seasons in lexical order.
    pub seasons: Vec<String>,
    /// Nesting substrates in lexical order.
    pub substrates: Vec<String>,
    /// Flight distance per species, in map units.
    pub alpha: BTreeMap<String, f64>,
    /// Relative abundance per species, normalized to sum 1.
    pub species_abundance: BTreeMap<String, f64>,
    /// Foraging activity per (species, season), normalized to sum 1 across
    /// seasons for each species.
    pub foraging_activity: BTreeMap<(String, String), f64>,
    /// Nesting suitability per (species, substrate), in `[0, 1]`.
    pub species_substrate: BTreeMap<(String, String), f64>,
    /// Per-substrate nesting availability by landcover code.
    pub landcover_substrate: BTreeMap<String, BTreeMap<i64, f64>>,
    /// Per-season floral resources by landcover code.
    pub landcover_floral: BTreeMap<String, BTreeMap<i64, f64>>,
}

impl ScenarioVariables {
    /// Parse and cross-validate the input tables. `farm` is the already
    /// loaded farm vector, when the run has one.
    pub fn build(
        guild_table_path: &Utf8Path,
        biophysical_table_path: &Utf8Path,
        farm: Option<&FarmVector>,
    ) -> Result<Self, ConfigError> {
        let guild = Table::read(guild_table_path, TableKind::Guild)?;
        let biophysical = Table::read(biophysical_table_path, TableKind::Biophysical)?;

        let guild_substrates = guild.pattern_names(NESTING_SUITABILITY_PREFIX, INDEX_SUFFIX)?;
        let guild_seasons = guild.pattern_names(FORAGING_ACTIVITY_PREFIX, INDEX_SUFFIX)?;
        let bio_substrates =
            biophysical.pattern_names(NESTING_AVAILABILITY_PREFIX, NESTING_AVAILABILITY_SUFFIX)?;
        let bio_seasons = biophysical.pattern_names(FLORAL_RESOURCES_PREFIX, INDEX_SUFFIX)?;

        cross_check("substrate", &guild_substrates, &bio_substrates)?;
        cross_check("season", &guild_seasons, &bio_seasons)?;
        let substrates: Vec<String> = guild_substrates.into_iter().collect();
        let seasons: Vec<String> = guild_seasons.into_iter().collect();

        if let Some(farm) = farm {
            validate_farm(farm, &seasons, &substrates)?;
        }

        let species_column = guild.column("species")?;
        let mut species = Vec::with_capacity(guild.rows.len());
        let mut alpha = BTreeMap::new();
        let mut species_abundance = BTreeMap::new();
        let mut foraging_activity = BTreeMap::new();
        let mut species_substrate = BTreeMap::new();

        for row in 0..guild.rows.len() {
            let name = guild.rows[row][species_column].to_lowercase();
            if species.contains(&name) {
                return Err(ConfigError::DuplicateKey {
                    table: TableKind::Guild,
                    key: name,
                });
            }

            alpha.insert(name.clone(), guild.number(row, "alpha")?);
            species_abundance.insert(name.clone(), guild.number(row, "relative_abundance")?);
            for season in &seasons {
                let column = format!("{FORAGING_ACTIVITY_PREFIX}{season}{INDEX_SUFFIX}");
                foraging_activity
                    .insert((name.clone(), season.clone()), guild.number(row, &column)?);
            }
            for substrate in &substrates {
                let column = format!("{NESTING_SUITABILITY_PREFIX}{substrate}{INDEX_SUFFIX}");
                species_substrate
                    .insert((name.clone(), substrate.clone()), guild.number(row, &column)?);
            }
            species.push(name);
        }
        // row order in the guild table must not leak into summation order
        species.sort();

        normalize_abundance(&mut species_abundance)?;
        normalize_foraging(&mut foraging_activity, &species, &seasons)?;

        let lucode_column = biophysical.column("lucode")?;
        let mut landcover_substrate: BTreeMap<String, BTreeMap<i64, f64>> = BTreeMap::new();
        let mut landcover_floral: BTreeMap<String, BTreeMap<i64, f64>> = BTreeMap::new();

        for row in 0..biophysical.rows.len() {
            let raw = &biophysical.rows[row][lucode_column];
            let lucode: i64 = raw.parse().map_err(|_| ConfigError::InvalidNumber {
                table: TableKind::Biophysical,
                column: "lucode".into(),
                value: raw.clone(),
            })?;
            if landcover_substrate
                .values()
                .next()
                .is_some_and(|m| m.contains_key(&lucode))
            {
                return Err(ConfigError::DuplicateKey {
                    table: TableKind::Biophysical,
                    key: raw.clone(),
                });
            }

            for substrate in &substrates {
                let column =
                    format!("{NESTING_AVAILABILITY_PREFIX}{substrate}{NESTING_AVAILABILITY_SUFFIX}");
                landcover_substrate
                    .entry(substrate.clone())
                    .or_default()
                    .insert(lucode, biophysical.number(row, &column)?);
            }
            for season in &seasons {
                let column = format!("{FLORAL_RESOURCES_PREFIX}{season}{INDEX_SUFFIX}");
                landcover_floral
                    .entry(season.clone())
                    .or_default()
                    .insert(lucode, biophysical.number(row, &column)?);
            }
        }

        Ok(Self {
            species,
            seasons,
            substrates,
            alpha,
            species_abundance,
            foraging_activity,
            species_substrate,
            landcover_substrate,
            landcover_floral,
        })
    }
}

/// Every name present in one table must be present in the other; the error
/// names the table the name is missing from.
fn cross_check(
    kind: &'static str,
    guild_names: &BTreeSet<String>,
    biophysical_names: &BTreeSet<String>,
) -> Result<(), ConfigError> {
    if let Some(name) = biophysical_names.difference(guild_names).next() {
        return Err(ConfigError::NameMismatch {
            kind,
            name: name.clone(),
            table: TableKind::Guild,
        });
    }
    if let Some(name) = guild_names.difference(biophysical_names).next() {
        return Err(ConfigError::NameMismatch {
            kind,
            name: name.clone(),
            table: TableKind::Biophysical,
        });
    }
    Ok(())
}

/// Farm features must use known seasons, and must carry floral-resource and
/// nesting overrides for every season and substrate the scenario defines.
fn validate_farm(
    farm: &FarmVector,
    seasons: &[String],
    substrates: &[String],
) -> Result<(), ConfigError> {
    for feature in &farm.features {
        if !seasons.contains(&feature.season) {
            return Err(ConfigError::UnknownFarmSeason(feature.season.clone()));
        }
        for season in feature.floral_resources.keys() {
            if !seasons.contains(season) {
                return Err(ConfigError::UnknownFarmSeason(season.clone()));
            }
        }
        for season in seasons {
            if !feature.floral_resources.contains_key(season) {
                return Err(ConfigError::NameMismatch {
                    kind: "season",
                    name: season.clone(),
                    table: TableKind::Farm,
                });
            }
        }
        for substrate in substrates {
            if !feature.nesting_substrates.contains_key(substrate) {
                return Err(ConfigError::NameMismatch {
                    kind: "substrate",
                    name: substrate.clone(),
                    table: TableKind::Farm,
                });
            }
        }
    }
    Ok(())
}

fn normalize_abundance(abundance: &mut BTreeMap<String, f64>) -> Result<(), ConfigError> {
    let total: f64 = abundance.values().sum();
    if total.abs() < NORMALIZATION_TOLERANCE {
        return Err(ConfigError::ZeroWeightSum {
            table: TableKind::Guild,
            column: "relative_abundance".into(),
        });
    }
    for value in abundance.values_mut() {
        *value /= total;
    }
    Ok(())
}

fn normalize_foraging(
    foraging: &mut BTreeMap<(String, String), f64>,
    species: &[String],
    seasons: &[String],
) -> Result<(), ConfigError> {
    for name in species {
        let total: f64 = seasons
            .iter()
            .map(|s| foraging[&(name.clone(), s.clone())])
            .sum();
        if total.abs() < NORMALIZATION_TOLERANCE {
            return Err(ConfigError::ZeroWeightSum {
                table: TableKind::Guild,
                column: format!("foraging_activity ({name})"),
            });
        }
        for season in seasons {
            *foraging.get_mut(&(name.clone(), season.clone())).unwrap() /= total;
        }
    }
    Ok(())
}

/// A parsed CSV table with lowercase headers. The input tables are plain
/// comma-separated text without quoting, matching the published sample data.
pub(crate) struct Table {
    kind: TableKind,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub(crate) fn read(path: &Utf8Path, kind: TableKind) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingFile(path.to_owned()));
        }
        let text = fs::read_to_string(path.as_std_path()).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;

        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let headers: Vec<String> = match lines.next() {
            Some(line) => line
                .split(',')
                .map(|h| h.trim().to_lowercase())
                .collect(),
            None => {
                return Err(ConfigError::MissingColumn {
                    table: kind,
                    column: "any".into(),
                });
            }
        };

        let mut rows = Vec::new();
        for (index, line) in lines.enumerate() {
            let fields: Vec<String> = line.split(',').map(|f| f.trim().to_owned()).collect();
            if fields.len() != headers.len() {
                return Err(ConfigError::RaggedRow {
                    table: kind,
                    row: index + 2,
                    got: fields.len(),
                    expected: headers.len(),
                });
            }
            rows.push(fields);
        }

        Ok(Self {
            kind,
            headers,
            rows,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    /// Raw text of one cell, by header name.
    pub(crate) fn text(&self, row: usize, column: &str) -> Result<&str, ConfigError> {
        Ok(&self.rows[row][self.column(column)?])
    }

    pub(crate) fn column(&self, name: &str) -> Result<usize, ConfigError> {
        self.headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ConfigError::MissingColumn {
                table: self.kind,
                column: name.into(),
            })
    }

    /// Names captured by columns matching `<prefix><name><suffix>`.
    fn pattern_names(&self, prefix: &str, suffix: &str) -> Result<BTreeSet<String>, ConfigError> {
        let names: BTreeSet<String> = self
            .headers
            .iter()
            .filter_map(|h| h.strip_prefix(prefix)?.strip_suffix(suffix))
            .map(str::to_owned)
            .collect();
        if names.is_empty() {
            return Err(ConfigError::MissingPattern {
                table: self.kind,
                pattern: format!("{prefix}<name>{suffix}"),
            });
        }
        Ok(names)
    }

    pub(crate) fn number(&self, row: usize, column: &str) -> Result<f64, ConfigError> {
        let index = self.column(column)?;
        let value = &self.rows[row][index];
        value.parse().map_err(|_| ConfigError::InvalidNumber {
            table: self.kind,
            column: column.into(),
            value: value.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::FarmFeature;
    use camino::Utf8PathBuf;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    const GUILD: &str = "\
species,nesting_suitability_cavity_index,foraging_activity_spring_index,foraging_activity_summer_index,alpha,relative_abundance
apis,0.4,0.6,0.2,500.0,0.75
bombus,1.0,0.2,0.6,1500.0,0.25
";

    const BIOPHYSICAL: &str = "\
lucode,nesting_cavity_availability_index,floral_resources_spring_index,floral_resources_summer_index
1,0.3,0.8,0.4
2,1.0,0.2,0.9
";

    fn write(dir: &Utf8Path, name: &str, text: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        fs::write(path.as_std_path(), text).unwrap();
        path
    }

    #[test]
    fn parses_and_normalizes_coefficients() {
        let (_guard, dir) = scratch();
        let guild = write(&dir, "guild.csv", GUILD);
        let bio = write(&dir, "biophysical.csv", BIOPHYSICAL);

        let vars = ScenarioVariables::build(&guild, &bio, None).unwrap();
        assert_eq!(vars.species, vec!["apis", "bombus"]);
        assert_eq!(vars.seasons, vec!["spring", "summer"]);
        assert_eq!(vars.substrates, vec!["cavity"]);
        assert_eq!(vars.alpha["apis"], 500.0);

        let abundance_total: f64 = vars.species_abundance.values().sum();
        assert!((abundance_total - 1.0).abs() < NORMALIZATION_TOLERANCE);

        // apis foraging: 0.6 + 0.2 normalized across seasons
        let spring = vars.foraging_activity[&("apis".into(), "spring".into())];
        let summer = vars.foraging_activity[&("apis".into(), "summer".into())];
        assert!((spring - 0.75).abs() < NORMALIZATION_TOLERANCE);
        assert!((spring + summer - 1.0).abs() < NORMALIZATION_TOLERANCE);

        assert_eq!(vars.landcover_floral["spring"][&1], 0.8);
        assert_eq!(vars.landcover_substrate["cavity"][&2], 1.0);
    }

    #[test]
    fn species_order_is_independent_of_row_order() {
        let (_guard, dir) = scratch();
        let guild = write(
            &dir,
            "guild.csv",
            "\
species,nesting_suitability_cavity_index,foraging_activity_spring_index,foraging_activity_summer_index,alpha,relative_abundance
osmia,0.7,0.5,0.5,300.0,0.1
apis,0.4,0.6,0.2,500.0,0.65
bombus,1.0,0.2,0.6,1500.0,0.25
",
        );
        let bio = write(&dir, "biophysical.csv", BIOPHYSICAL);

        let vars = ScenarioVariables::build(&guild, &bio, None).unwrap();
        assert_eq!(vars.species, vec!["apis", "bombus", "osmia"]);
    }

    #[test]
    fn season_defined_only_in_biophysical_names_the_guild_table() {
        let (_guard, dir) = scratch();
        let guild = write(
            &dir,
            "guild.csv",
            "\
species,nesting_suitability_cavity_index,foraging_activity_spring_index,alpha,relative_abundance
apis,0.4,1.0,500.0,1.0
",
        );
        let bio = write(&dir, "biophysical.csv", BIOPHYSICAL);

        let err = ScenarioVariables::build(&guild, &bio, None).unwrap_err();
        match err {
            ConfigError::NameMismatch { kind, name, table } => {
                assert_eq!(kind, "season");
                assert_eq!(name, "summer");
                assert_eq!(table, TableKind::Guild);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ragged_row_reports_position() {
        let (_guard, dir) = scratch();
        let guild = write(&dir, "guild.csv", GUILD);
        let bio = write(
            &dir,
            "biophysical.csv",
            "\
lucode,nesting_cavity_availability_index,floral_resources_spring_index,floral_resources_summer_index
1,0.3,0.8
",
        );

        let err = ScenarioVariables::build(&guild, &bio, None).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::RaggedRow {
                table: TableKind::Biophysical,
                row: 2,
                got: 3,
                expected: 4,
            }
        ));
    }

    #[test]
    fn duplicate_species_is_rejected() {
        let (_guard, dir) = scratch();
        let guild = write(
            &dir,
            "guild.csv",
            "\
species,nesting_suitability_cavity_index,foraging_activity_spring_index,foraging_activity_summer_index,alpha,relative_abundance
apis,0.4,0.6,0.2,500.0,0.5
apis,1.0,0.2,0.6,1500.0,0.5
",
        );
        let bio = write(&dir, "biophysical.csv", BIOPHYSICAL);

        let err = ScenarioVariables::build(&guild, &bio, None).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateKey { .. }));
    }

    fn farm_feature(season: &str) -> FarmFeature {
        FarmFeature {
            season: season.into(),
            crop_type: "blueberry".into(),
            half_sat: 0.3,
            p_dep: 0.9,
            p_managed: 0.1,
            floral_resources: BTreeMap::from([
                ("spring".to_string(), 0.5),
                ("summer".to_string(), 0.5),
            ]),
            nesting_substrates: BTreeMap::from([("cavity".to_string(), 0.4)]),
            polygon: vec![[0.0, 0.0], [10.0, 0.0], [10.0, -10.0], [0.0, -10.0]],
            results: None,
        }
    }

    #[test]
    fn farm_with_unknown_season_is_rejected() {
        let (_guard, dir) = scratch();
        let guild = write(&dir, "guild.csv", GUILD);
        let bio = write(&dir, "biophysical.csv", BIOPHYSICAL);
        let farm = FarmVector {
            projection: "local".into(),
            features: vec![farm_feature("autumn")],
        };

        let err = ScenarioVariables::build(&guild, &bio, Some(&farm)).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFarmSeason(name) if name == "autumn"));
    }

    #[test]
    fn farm_missing_substrate_override_is_rejected() {
        let (_guard, dir) = scratch();
        let guild = write(&dir, "guild.csv", GUILD);
        let bio = write(&dir, "biophysical.csv", BIOPHYSICAL);
        let mut feature = farm_feature("spring");
        feature.nesting_substrates.clear();
        let farm = FarmVector {
            projection: "local".into(),
            features: vec![feature],
        };

        let err = ScenarioVariables::build(&guild, &bio, Some(&farm)).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NameMismatch {
                kind: "substrate",
                table: TableKind::Farm,
                ..
            }
        ));
    }

    #[test]
    fn zero_abundance_sum_is_rejected() {
        let (_guard, dir) = scratch();
        let guild = write(
            &dir,
            "guild.csv",
            "\
species,nesting_suitability_cavity_index,foraging_activity_spring_index,foraging_activity_summer_index,alpha,relative_abundance
apis,0.4,0.6,0.2,500.0,0.0
",
        );
        let bio = write(&dir, "biophysical.csv", BIOPHYSICAL);

        let err = ScenarioVariables::build(&guild, &bio, None).unwrap_err();
        assert!(matches!(err, ConfigError::ZeroWeightSum { .. }));
    }

    #[test]
    fn missing_guild_file_is_reported() {
        let (_guard, dir) = scratch();
        let bio = write(&dir, "biophysical.csv", BIOPHYSICAL);
        let err =
            ScenarioVariables::build(&dir.join("absent.csv"), &bio, None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }
}
