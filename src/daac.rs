//! Static table of NASA Earthdata data centers (DAACs).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Daac {
    pub short_name: &'static str,
    pub name: &'static str,
    pub homepage: &'static str,
    pub cloud_providers: &'static [&'static str],
    pub on_prem_providers: &'static [&'static str],
    /// Empty when the center has no cloud-hosted data.
    pub s3_credentials: &'static str,
}

pub const DAACS: &[Daac] = &[
    Daac {
        short_name: "NSIDC",
        name: "National Snow and Ice Data Center",
        homepage: "https://nsidc.org",
        cloud_providers: &["NSIDC_CPRD"],
        on_prem_providers: &["NSIDC_ECS"],
        s3_credentials: "https://data.nsidc.earthdatacloud.nasa.gov/s3credentials",
    },
    Daac {
        short_name: "GHRCDAAC",
        name: "Global Hydrometeorology Resource Center",
        homepage: "https://ghrc.nsstc.nasa.gov/home/",
        cloud_providers: &["GHRC_DAAC"],
        on_prem_providers: &["GHRC_DAAC"],
        s3_credentials: "https://data.ghrc.earthdata.nasa.gov/s3credentials",
    },
    Daac {
        short_name: "PODAAC",
        name: "Physical Oceanography Distributed Active Archive Center",
        homepage: "https://podaac.jpl.nasa.gov",
        cloud_providers: &["POCLOUD"],
        on_prem_providers: &["PODAAC"],
        s3_credentials: "https://archive.podaac.earthdata.nasa.gov/s3credentials",
    },
    Daac {
        short_name: "ASF",
        name: "Alaska Satellite Facility",
        homepage: "https://asf.alaska.edu",
        cloud_providers: &["ASF"],
        on_prem_providers: &["ASF"],
        s3_credentials: "https://sentinel1.asf.alaska.edu/s3credentials",
    },
    Daac {
        short_name: "ORNLDAAC",
        name: "Oak Ridge National Laboratory",
        homepage: "https://daac.ornl.gov",
        cloud_providers: &["ORNL_CLOUD"],
        on_prem_providers: &["ORNL_DAAC"],
        s3_credentials: "https://data.ornldaac.earthdata.nasa.gov/s3credentials",
    },
    Daac {
        short_name: "LPDAAC",
        name: "Land Processes Distributed Active Archive Center",
        homepage: "https://lpdaac.usgs.gov",
        cloud_providers: &["LPCLOUD"],
        on_prem_providers: &["LPDAAC_ECS"],
        s3_credentials: "https://data.lpdaac.earthdatacloud.nasa.gov/s3credentials",
    },
    Daac {
        short_name: "GES_DISC",
        name: "NASA Goddard Earth Sciences (GES) Data and Information Services Center (DISC)",
        homepage: "https://daac.gsfc.nasa.gov",
        cloud_providers: &["GES_DISC"],
        on_prem_providers: &["GES_DISC"],
        s3_credentials: "https://data.gesdisc.earthdata.nasa.gov/s3credentials",
    },
    Daac {
        short_name: "OBDAAC",
        name: "NASA's Ocean Biology Distributed Active Archive Center",
        homepage: "https://earthdata.nasa.gov/eosdis/daacs/obdaac",
        cloud_providers: &[],
        on_prem_providers: &["OB_DAAC"],
        s3_credentials: "",
    },
    Daac {
        short_name: "SEDAC",
        name: "NASA's Socioeconomic Data and Applications Center",
        homepage: "https://earthdata.nasa.gov/eosdis/daacs/sedac",
        cloud_providers: &[],
        on_prem_providers: &["SEDAC"],
        s3_credentials: "",
    },
    Daac {
        short_name: "LAADS",
        name: "Level-1 and Atmosphere Archive & Distribution System Distributed Active Archive Center",
        homepage: "https://ladsweb.modaps.eosdis.nasa.gov/",
        cloud_providers: &["LAADS"],
        on_prem_providers: &["LAADS"],
        s3_credentials: "https://data.laadsdaac.earthdatacloud.nasa.gov/s3credentials",
    },
];

pub fn find_daac(short_name: &str) -> Option<&'static Daac> {
    DAACS
        .iter()
        .find(|d| d.short_name.eq_ignore_ascii_case(short_name.trim()))
}

/// Provider code for a DAAC. A center without cloud data answers with its
/// on-prem provider even when `cloud_hosted` is requested.
pub fn find_provider(daac_short_name: &str, cloud_hosted: bool) -> Option<&'static str> {
    let daac = find_daac(daac_short_name)?;
    if cloud_hosted {
        if let Some(p) = daac.cloud_providers.first() {
            return Some(p);
        }
    }
    daac.on_prem_providers.first().copied()
}

/// S3 credentials endpoint of the DAAC that owns `provider`.
pub fn s3_credentials_endpoint(provider: &str) -> Option<&'static str> {
    DAACS
        .iter()
        .find(|d| d.cloud_providers.contains(&provider) || d.on_prem_providers.contains(&provider))
        .map(|d| d.s3_credentials)
        .filter(|e| !e.is_empty())
}
